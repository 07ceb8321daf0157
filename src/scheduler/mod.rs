//! Admission scheduling for continuous batching.
//!
//! This module handles:
//! - The waiting queue, drained in submission order
//! - Block-budget admission against the cache pool
//! - Parking the engine thread until work or a stop request arrives

pub mod fifo;

pub use fifo::FifoScheduler;
