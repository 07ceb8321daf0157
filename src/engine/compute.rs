//! Accelerator compute interface.
//!
//! Each round the executor hands the backend a [`BatchDescriptor`]:
//!
//! ```text
//! BatchDescriptor
//! ├── block_copies   fork-on-extend copies, applied first
//! ├── rows[0..g]     generate rows: one position each
//! └── rows[g..]      context rows: a span of input positions each
//! ```
//!
//! and expects exactly one [`RowOutput`] per row back, in row order.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::core::block::{BlockCopy, BlockId};
use crate::core::stream::StreamId;
use crate::engine::lora::LoraAdapter;
use crate::error::{Error, Result};

/// Which phase a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPhase {
    /// Computing previously uncomputed input positions.
    Context,
    /// Producing one new token.
    Generate,
}

/// What the backend must return for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Next-token logits `[vocab]`.
    Logits,
    /// Pooled hidden state `[hidden]`.
    Embedding,
    /// Nothing (an intermediate context chunk).
    None,
}

/// One stream's work for the round.
#[derive(Debug, Clone)]
pub struct BatchRow {
    /// Stream the row belongs to.
    pub stream_id: StreamId,
    /// Context or generate.
    pub phase: RowPhase,
    /// Tokens to run, at positions `position_offset..`.
    pub token_ids: Vec<u32>,
    /// Position of the first token in `token_ids`.
    pub position_offset: usize,
    /// The stream's block table after any forks.
    pub block_ids: Vec<BlockId>,
    /// Cache slot for each token in `token_ids`.
    pub slot_mapping: Vec<usize>,
    /// Adapter weights, if the stream uses one.
    pub lora: Option<Arc<LoraAdapter>>,
    /// Output expected for this row.
    pub output: OutputKind,
}

impl BatchRow {
    /// Positions visible to attention after this row: `0..context_len()`.
    pub fn context_len(&self) -> usize {
        self.position_offset + self.token_ids.len()
    }
}

/// Everything the backend needs for one round.
#[derive(Debug, Clone, Default)]
pub struct BatchDescriptor {
    /// Tokens per cache block.
    pub block_size: usize,
    /// Generate rows first, then context rows.
    pub rows: Vec<BatchRow>,
    /// Number of leading generate rows.
    pub num_generate_rows: usize,
    /// Copies to perform before any row runs.
    pub block_copies: Vec<BlockCopy>,
}

impl BatchDescriptor {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of context rows.
    pub fn num_context_rows(&self) -> usize {
        self.rows.len() - self.num_generate_rows
    }

    /// Total tokens across rows.
    pub fn num_tokens(&self) -> usize {
        self.rows.iter().map(|r| r.token_ids.len()).sum()
    }

    /// Generate rows.
    pub fn generate_rows(&self) -> &[BatchRow] {
        &self.rows[..self.num_generate_rows]
    }

    /// Context rows.
    pub fn context_rows(&self) -> &[BatchRow] {
        &self.rows[self.num_generate_rows..]
    }
}

/// Result for one row.
#[derive(Debug, Clone)]
pub enum RowOutput {
    /// Next-token logits.
    Logits(Tensor),
    /// Embedding vector.
    Embedding(Tensor),
    /// No output requested.
    Empty,
}

/// Result of one forward pass.
#[derive(Debug, Clone, Default)]
pub struct ComputeOutput {
    /// One entry per descriptor row, in order.
    pub rows: Vec<RowOutput>,
}

/// The accelerator collaborator. Called only from the engine thread.
pub trait ComputeBackend: Send {
    /// Apply `batch.block_copies`, run every row, return one output per row.
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<ComputeOutput>;
}

/// Deterministic CPU stand-in for a model.
///
/// Keeps the token stored at every cache slot, so reading a position that
/// was never written (or was clobbered) is caught as a compute error. The
/// "model" predicts [`SyntheticBackend::next_token`] of the full context read
/// back from the cache.
#[derive(Debug)]
pub struct SyntheticBackend {
    vocab_size: usize,
    hidden_size: usize,
    device: Device,
    kv: HashMap<usize, u32>,
}

impl SyntheticBackend {
    /// Create a backend with the given vocabulary and hidden sizes.
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size,
            device: Device::Cpu,
            kv: HashMap::new(),
        }
    }

    /// Token the synthetic model predicts after `context`.
    pub fn next_token(context: &[u32], lora_id: Option<u64>, vocab_size: usize) -> u32 {
        let sum: u64 = context.iter().map(|&t| u64::from(t)).sum();
        ((sum + 1 + lora_id.unwrap_or(0)) % vocab_size as u64) as u32
    }

    /// Embedding the synthetic model produces for `context`.
    pub fn embed(context: &[u32], hidden_size: usize) -> Vec<f32> {
        let len = context.len().max(1) as f32;
        (0..hidden_size)
            .map(|i| {
                let sum: u64 = context
                    .iter()
                    .map(|&t| (u64::from(t) * (i as u64 + 1)) % 97)
                    .sum();
                sum as f32 / (97.0 * len)
            })
            .collect()
    }

    fn read_context(&self, row: &BatchRow, block_size: usize) -> Result<Vec<u32>> {
        (0..row.context_len())
            .map(|pos| {
                let block = row.block_ids.get(pos / block_size).ok_or_else(|| {
                    Error::Compute(format!(
                        "stream {}: position {pos} has no block",
                        row.stream_id
                    ))
                })?;
                let slot = block * block_size + pos % block_size;
                self.kv.get(&slot).copied().ok_or_else(|| {
                    Error::Compute(format!(
                        "stream {}: read of unwritten slot {slot} (position {pos})",
                        row.stream_id
                    ))
                })
            })
            .collect()
    }
}

impl ComputeBackend for SyntheticBackend {
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<ComputeOutput> {
        let block_size = batch.block_size;
        for copy in &batch.block_copies {
            for offset in 0..block_size {
                if let Some(&token) = self.kv.get(&(copy.src * block_size + offset)) {
                    self.kv.insert(copy.dst * block_size + offset, token);
                }
            }
        }

        let mut rows = Vec::with_capacity(batch.rows.len());
        for row in &batch.rows {
            if row.slot_mapping.len() != row.token_ids.len() {
                return Err(Error::Compute(format!(
                    "stream {}: {} slots for {} tokens",
                    row.stream_id,
                    row.slot_mapping.len(),
                    row.token_ids.len()
                )));
            }
            for (&slot, &token) in row.slot_mapping.iter().zip(&row.token_ids) {
                self.kv.insert(slot, token);
            }
            let context = self.read_context(row, block_size)?;

            let output = match row.output {
                OutputKind::None => RowOutput::Empty,
                OutputKind::Logits => {
                    let lora_id = row.lora.as_ref().map(|a| a.id());
                    let next = Self::next_token(&context, lora_id, self.vocab_size);
                    let mut logits = vec![0f32; self.vocab_size];
                    logits[next as usize] = 10.0;
                    RowOutput::Logits(Tensor::from_vec(logits, self.vocab_size, &self.device)?)
                }
                OutputKind::Embedding => {
                    let embedding = Self::embed(&context, self.hidden_size);
                    RowOutput::Embedding(Tensor::from_vec(
                        embedding,
                        self.hidden_size,
                        &self.device,
                    )?)
                }
            };
            rows.push(output);
        }
        Ok(ComputeOutput { rows })
    }
}
