//! Core infrastructure for nano-batch.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - CacheManager for block allocation, sharing and release
//! - Stream for request tracking and caller wake-up

pub mod block;
pub mod cache_manager;
pub mod stream;
