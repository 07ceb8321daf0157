//! nano-batch: continuous batching core for transformer inference.
//!
//! This crate implements the serving loop around a model:
//! - A block-based KV cache with reference counting, prefix reuse and
//!   fork-on-extend
//! - A FIFO scheduler admitting streams against the cache budget
//! - An executor that splits each round into context and generate rows
//! - An engine thread driving schedule -> execute until stopped
//!
//! The model itself sits behind [`ComputeBackend`].

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use crate::core::cache_manager::{CacheManager, CacheStats};
pub use crate::core::stream::{
    FinishReason, Stream, StreamHandle, StreamId, StreamOutput, StreamRequest, StreamState,
};
pub use config::{CacheConfig, EngineConfig, GenerateConfig, SchedulerConfig};
pub use engine::{ComputeBackend, Engine, LoraAdapter, SyntheticBackend};
pub use error::{Error, ErrorCode, Result, StreamError};
pub use scheduler::FifoScheduler;
