//! Inference engine.
//!
//! This module contains:
//! - Engine, which owns the step loop thread
//! - Executor for partitioning and running each round
//! - ComputeBackend, the accelerator interface, and a synthetic backend
//! - LoRA adapter store
//! - Sampler for token selection

pub mod compute;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod executor;
pub mod lora;
pub mod sampler;

pub use compute::{
    BatchDescriptor, BatchRow, ComputeBackend, ComputeOutput, OutputKind, RowOutput, RowPhase,
    SyntheticBackend,
};
pub use engine::Engine;
pub use executor::{Executor, RoundSummary};
pub use lora::{AdapterId, LoraAdapter, LoraRegistry};
pub use sampler::Sampler;
