//! Configuration types for nano-batch.
//!
//! All values arrive already resolved; the engine only consumes them.
//! Every struct deserializes from partial JSON, falling back to defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// KV cache pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per cache block.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
    /// Share computed prefixes across streams.
    pub enable_reuse: bool,
    /// Reclaim idle cached prefixes when the pool runs dry.
    pub enable_prefix_eviction: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 1024,
            enable_reuse: false,
            enable_prefix_eviction: true,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of streams admitted at once.
    pub max_running_streams: usize,
    /// Split long context phases across rounds.
    pub enable_chunked_context: bool,
    /// Maximum context positions per stream per round when chunking.
    pub context_chunk_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running_streams: 256,
            enable_chunked_context: false,
            context_chunk_size: 512,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache pool settings.
    pub cache: CacheConfig,
    /// Admission settings.
    pub scheduler: SchedulerConfig,
    /// Hard upper bound on input + output length of any stream.
    pub max_seq_len: usize,
    /// Run the cache accounting check after every round.
    pub verify_cache_invariants: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            max_seq_len: 8192,
            verify_cache_invariants: true,
        }
    }
}

impl EngineConfig {
    /// Load an engine configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the resolved values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.cache.block_size == 0 {
            return Err(Error::Config("cache.block_size must be > 0".to_string()));
        }
        if self.cache.num_blocks == 0 {
            return Err(Error::Config("cache.num_blocks must be > 0".to_string()));
        }
        if self.scheduler.max_running_streams == 0 {
            return Err(Error::Config(
                "scheduler.max_running_streams must be > 0".to_string(),
            ));
        }
        if self.scheduler.enable_chunked_context && self.scheduler.context_chunk_size == 0 {
            return Err(Error::Config(
                "scheduler.context_chunk_size must be > 0 when chunking".to_string(),
            ));
        }
        if self.max_seq_len == 0 {
            return Err(Error::Config("max_seq_len must be > 0".to_string()));
        }
        Ok(())
    }

    /// Builder-style helper used mostly by tests.
    pub fn with_pool(mut self, num_blocks: usize, block_size: usize) -> Self {
        self.cache.num_blocks = num_blocks;
        self.cache.block_size = block_size;
        self
    }
}

/// Per-request generation settings: stop conditions and sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Stop tokens and stop sequences are ignored before this many tokens.
    pub min_new_tokens: usize,
    /// Tokens that end generation (e.g. EOS).
    pub stop_token_ids: Vec<u32>,
    /// Token sequences that end generation when the output ends with them.
    pub stop_sequences: Vec<Vec<u32>>,
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            min_new_tokens: 0,
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
        }
    }
}

impl GenerateConfig {
    /// Greedy decoding with the given token budget.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            ..Self::default()
        }
    }
}
