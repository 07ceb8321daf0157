//! Per-round batch execution.
//!
//! ## Round Flow
//!
//! ```text
//!  admitted streams
//!        │
//!        ▼  plan: resolve LoRA, pick context span or last token,
//!        │        extend cache (fork shared blocks), or Pause
//!  ┌───────────────┐
//!  │ BatchDescriptor│  generate rows ++ context rows + block copies
//!  └───────────────┘
//!        │
//!        ▼  ComputeBackend::forward
//!  ┌───────────────┐
//!  │ ComputeOutput │  one RowOutput per row
//!  └───────────────┘
//!        │
//!        ▼  write back: advance computed positions, sample, check stop,
//!           finish + release, register prefixes
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::DType;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::core::cache_manager::CacheManager;
use crate::core::stream::{FinishReason, StreamHandle, StreamId, StreamState};
use crate::engine::compute::{
    BatchDescriptor, BatchRow, ComputeBackend, OutputKind, RowOutput, RowPhase,
};
use crate::engine::lora::LoraRegistry;
use crate::engine::sampler::Sampler;
use crate::error::{Error, ErrorCode, Result, StreamError};

/// Counters for one executor round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Rows producing one token.
    pub generate_rows: usize,
    /// Rows computing input positions.
    pub context_rows: usize,
    /// Streams paused for lack of cache blocks.
    pub paused: usize,
    /// Streams that finished this round.
    pub finished: usize,
    /// Streams that errored this round.
    pub errored: usize,
}

impl RoundSummary {
    /// Rows sent to the backend.
    pub fn num_rows(&self) -> usize {
        self.generate_rows + self.context_rows
    }
}

enum RowPlan {
    Ready(BatchRow),
    Paused,
    Failed,
}

enum RowResult {
    Continue,
    Finished,
}

/// Drives the compute backend once per round and writes results back.
pub struct Executor {
    cache: Arc<CacheManager>,
    adapters: Arc<LoraRegistry>,
    backend: Box<dyn ComputeBackend>,
    samplers: HashMap<StreamId, Sampler>,
    max_seq_len: usize,
    /// Context positions per row per round, when chunking.
    context_chunk_size: Option<usize>,
}

impl Executor {
    /// Create an executor over the shared cache and adapter store.
    pub fn new(
        config: &EngineConfig,
        cache: Arc<CacheManager>,
        adapters: Arc<LoraRegistry>,
        backend: Box<dyn ComputeBackend>,
    ) -> Self {
        let context_chunk_size = config
            .scheduler
            .enable_chunked_context
            .then_some(config.scheduler.context_chunk_size);
        Self {
            cache,
            adapters,
            backend,
            samplers: HashMap::new(),
            max_seq_len: config.max_seq_len,
            context_chunk_size,
        }
    }

    /// Run one round over the admitted streams.
    ///
    /// Per-stream problems (missing adapter, bad output row) error only that
    /// stream. A stream that cannot get cache blocks is Paused; if every
    /// stream is Paused the newest one is Errored with
    /// [`Error::ResourceUnavailable`] so the rest can make progress.
    ///
    /// # Errors
    ///
    /// - [`Error::Compute`] if the backend failed; every stream in the round
    ///   has been Errored and released.
    /// - [`Error::CacheCorrupted`] on broken block accounting (fatal).
    pub fn process(&mut self, batch: &[StreamHandle]) -> Result<RoundSummary> {
        let live: Vec<&StreamHandle> = batch.iter().filter(|s| !s.is_terminal()).collect();
        self.samplers
            .retain(|id, _| live.iter().any(|s| s.id() == *id));

        let mut summary = RoundSummary::default();
        let mut generate = Vec::new();
        let mut context = Vec::new();
        let mut block_copies = Vec::new();

        for stream in &live {
            match self.plan_row(stream)? {
                RowPlan::Ready(row) => {
                    block_copies.extend(stream.take_copies());
                    match row.phase {
                        RowPhase::Generate => generate.push((Arc::clone(stream), row)),
                        RowPhase::Context => context.push((Arc::clone(stream), row)),
                    }
                }
                RowPlan::Paused => summary.paused += 1,
                RowPlan::Failed => summary.errored += 1,
            }
        }

        if generate.is_empty() && context.is_empty() {
            if summary.paused > 0 {
                self.break_stall(&live)?;
                summary.paused -= 1;
                summary.errored += 1;
            }
            return Ok(summary);
        }

        summary.generate_rows = generate.len();
        summary.context_rows = context.len();
        let (streams, rows): (Vec<StreamHandle>, Vec<BatchRow>) =
            generate.into_iter().chain(context).unzip();
        let descriptor = BatchDescriptor {
            block_size: self.cache.block_size(),
            rows,
            num_generate_rows: summary.generate_rows,
            block_copies,
        };
        debug!(
            generate_rows = summary.generate_rows,
            context_rows = summary.context_rows,
            tokens = descriptor.num_tokens(),
            block_copies = descriptor.block_copies.len(),
            "running round"
        );

        let output = match self.backend.forward(&descriptor) {
            Ok(output) if output.rows.len() == descriptor.len() => output,
            Ok(output) => {
                let err = Error::Compute(format!(
                    "backend returned {} rows for a batch of {}",
                    output.rows.len(),
                    descriptor.len()
                ));
                return self.fail_round(&streams, err);
            }
            Err(err) => return self.fail_round(&streams, err),
        };

        for ((stream, row), out) in streams.iter().zip(&descriptor.rows).zip(output.rows) {
            stream.record_iteration();
            match self.write_back(stream, row, out) {
                Ok(RowResult::Continue) => {}
                Ok(RowResult::Finished) => summary.finished += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.fail_stream(stream, &err)?;
                    summary.errored += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Build this round's row for `stream`, or pause/fail it.
    fn plan_row(&mut self, stream: &StreamHandle) -> Result<RowPlan> {
        let lora = match stream.lora_id() {
            Some(id) => match self.adapters.get(id) {
                Some(adapter) => Some(adapter),
                None => {
                    self.fail_stream(stream, &Error::AdapterNotFound(id))?;
                    return Ok(RowPlan::Failed);
                }
            },
            None => None,
        };

        let computed = stream.computed_len();
        let input_len = stream.input_len();
        let (phase, token_ids, required, output) = if computed < input_len {
            let end = match self.context_chunk_size {
                Some(chunk) if !stream.is_embedding() => (computed + chunk).min(input_len),
                _ => input_len,
            };
            let output = if end < input_len {
                OutputKind::None
            } else if stream.is_embedding() {
                OutputKind::Embedding
            } else {
                OutputKind::Logits
            };
            let tokens = stream.input_ids()[computed..end].to_vec();
            (RowPhase::Context, tokens, end, output)
        } else {
            let Some(&last) = stream.output_ids().last() else {
                let err = Error::InvalidState {
                    stream_id: stream.id(),
                    state: stream.state().as_str(),
                    operation: "generate without a sampled token",
                };
                self.fail_stream(stream, &err)?;
                return Ok(RowPlan::Failed);
            };
            (RowPhase::Generate, vec![last], stream.seq_len(), OutputKind::Logits)
        };

        let extended =
            stream.with_block_table(|table| self.cache.extend(table, computed, required));
        match extended {
            Ok(copies) => {
                stream.push_copies(copies);
                stream.resume()?;
            }
            Err(Error::CacheExhausted {
                requested,
                available,
            }) => {
                if stream.state() == StreamState::Running {
                    debug!(
                        stream_id = stream.id(),
                        requested, available, "pausing stream: cache exhausted"
                    );
                }
                stream.set_paused()?;
                return Ok(RowPlan::Paused);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                self.fail_stream(stream, &err)?;
                return Ok(RowPlan::Failed);
            }
        }

        let (block_ids, slot_mapping) = stream.with_block_table(|table| {
            (
                table.get_physical_block_ids().to_vec(),
                table.get_slot_mapping(computed, required),
            )
        });
        Ok(RowPlan::Ready(BatchRow {
            stream_id: stream.id(),
            phase,
            token_ids,
            position_offset: computed,
            block_ids,
            slot_mapping,
            lora,
            output,
        }))
    }

    fn write_back(&mut self, stream: &StreamHandle, row: &BatchRow, out: RowOutput) -> Result<RowResult> {
        stream.advance_computed(row.token_ids.len());

        match (row.phase, row.output) {
            (_, OutputKind::None) => Ok(RowResult::Continue),
            (_, OutputKind::Embedding) => {
                let RowOutput::Embedding(tensor) = out else {
                    return Err(Error::Compute(format!(
                        "stream {}: expected an embedding row",
                        stream.id()
                    )));
                };
                let embedding: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
                stream.set_embedding(embedding)?;
                self.complete(stream, FinishReason::Embedded)?;
                Ok(RowResult::Finished)
            }
            (RowPhase::Context, OutputKind::Logits) => {
                if self.cache.reuse_enabled() {
                    let prefix_len = stream.request().prefix_len;
                    stream.with_block_table(|table| {
                        self.cache
                            .register_prefix(stream.input_ids(), table, prefix_len)
                    });
                }
                if let Some(reason) = stream.stop_reason(self.max_seq_len) {
                    self.complete(stream, reason)?;
                    return Ok(RowResult::Finished);
                }
                self.sample_and_append(stream, out)
            }
            (RowPhase::Generate, OutputKind::Logits) => self.sample_and_append(stream, out),
        }
    }

    fn sample_and_append(&mut self, stream: &StreamHandle, out: RowOutput) -> Result<RowResult> {
        let RowOutput::Logits(logits) = out else {
            return Err(Error::Compute(format!(
                "stream {}: expected a logits row",
                stream.id()
            )));
        };
        let config = stream.generate_config().ok_or(Error::InvalidState {
            stream_id: stream.id(),
            state: "Running",
            operation: "sample for an embedding stream",
        })?;
        let token = self
            .samplers
            .entry(stream.id())
            .or_insert_with(|| Sampler::from_config(config))
            .sample(&logits)?;

        match stream.append_output(token, self.max_seq_len)? {
            Some(reason) => {
                self.complete(stream, reason)?;
                Ok(RowResult::Finished)
            }
            None => Ok(RowResult::Continue),
        }
    }

    fn complete(&mut self, stream: &StreamHandle, reason: FinishReason) -> Result<()> {
        // Blocks go back before the waiter wakes.
        let freed = stream.release_cache(&self.cache)?;
        stream.finish(reason);
        self.samplers.remove(&stream.id());
        debug!(stream_id = stream.id(), ?reason, freed, "stream finished");
        Ok(())
    }

    fn fail_stream(&mut self, stream: &StreamHandle, err: &Error) -> Result<()> {
        warn!(stream_id = stream.id(), error = %err, "stream failed");
        stream.release_cache(&self.cache)?;
        stream.set_error(err);
        self.samplers.remove(&stream.id());
        Ok(())
    }

    /// Error every stream of a failed round and report the failure.
    fn fail_round(&mut self, streams: &[StreamHandle], err: Error) -> Result<RoundSummary> {
        let message = err.to_string();
        for stream in streams {
            stream.release_cache(&self.cache)?;
            stream.set_error(StreamError::new(ErrorCode::Compute, message.clone()));
            self.samplers.remove(&stream.id());
        }
        Err(Error::Compute(message))
    }

    /// Every admitted stream is Paused: error the newest one.
    fn break_stall(&mut self, live: &[&StreamHandle]) -> Result<()> {
        let newest = live
            .iter()
            .filter(|s| s.state() == StreamState::Paused)
            .max_by_key(|s| s.id());
        if let Some(stream) = newest {
            let err = Error::ResourceUnavailable(format!(
                "stream {} cannot get cache blocks while every stream is paused",
                stream.id()
            ));
            self.fail_stream(stream, &err)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("max_seq_len", &self.max_seq_len)
            .field("context_chunk_size", &self.context_chunk_size)
            .field("samplers", &self.samplers.len())
            .finish_non_exhaustive()
    }
}
