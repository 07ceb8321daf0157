//! Stream: one request moving through the engine.
//!
//! A stream is shared between the caller (who waits on it) and the engine
//! (which drives it). All mutable state sits behind one mutex, and a condition
//! variable wakes callers blocked in [`Stream::wait_finish`].
//!
//! ## State machine
//!
//! ```text
//!   Waiting ──► Running ◄──► Paused
//!      │           │            │
//!      │           ▼            │
//!      │       Finished         │
//!      └─────────► Errored ◄────┘
//! ```
//!
//! Finished and Errored are terminal. Reaching a terminal state a second time
//! is a no-op, so the first outcome always wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::GenerateConfig;
use crate::core::block::{BlockCopy, BlockId, BlockTable};
use crate::core::cache_manager::CacheManager;
use crate::error::{Error, Result, StreamError};

/// Unique identifier for a stream, assigned in submission order.
pub type StreamId = u64;

/// Shared handle to a stream held by the caller and the engine.
pub type StreamHandle = Arc<Stream>;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Queued, not yet admitted.
    Waiting,
    /// Admitted and contributing rows.
    Running,
    /// Admitted, but blocked on cache blocks this round.
    Paused,
    /// Completed normally.
    Finished,
    /// Failed; see the recorded error.
    Errored,
}

impl StreamState {
    /// Finished or Errored.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Errored)
    }

    /// Running or Paused.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Errored => "Errored",
        }
    }
}

/// Why a stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Produced `max_new_tokens` tokens.
    MaxTokens,
    /// Reached the engine's maximum sequence length.
    MaxSeqLen,
    /// Produced a stop token.
    StopToken,
    /// Output ended with a stop sequence.
    StopSequence,
    /// Embedding computed.
    Embedded,
}

/// What a stream computes.
#[derive(Debug, Clone)]
pub enum StreamKind {
    /// Autoregressive generation: context phase, then one token per round.
    Generate(GenerateConfig),
    /// Single-pass embedding of the input.
    Embedding,
}

/// A request submitted to the engine.
///
/// # Example
///
/// ```
/// use nano_batch::core::stream::StreamRequest;
/// use nano_batch::GenerateConfig;
///
/// let request = StreamRequest::generate(vec![1, 2, 3, 4], GenerateConfig::greedy(8))
///     .with_prefix_len(2)
///     .with_lora(7);
/// assert_eq!(request.input_len(), 4);
/// assert!(!request.is_embedding());
/// ```
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Input token IDs.
    pub token_ids: Vec<u32>,
    /// Generation or embedding.
    pub kind: StreamKind,
    /// Length of a shared leading prefix (e.g. a system prompt).
    pub prefix_len: Option<usize>,
    /// LoRA adapter to apply.
    pub lora_id: Option<u64>,
}

impl StreamRequest {
    /// Create a generation request.
    pub fn generate(token_ids: Vec<u32>, config: GenerateConfig) -> Self {
        Self {
            token_ids,
            kind: StreamKind::Generate(config),
            prefix_len: None,
            lora_id: None,
        }
    }

    /// Create an embedding request.
    pub fn embedding(token_ids: Vec<u32>) -> Self {
        Self {
            token_ids,
            kind: StreamKind::Embedding,
            prefix_len: None,
            lora_id: None,
        }
    }

    /// Declare a reusable leading prefix.
    pub fn with_prefix_len(mut self, prefix_len: usize) -> Self {
        self.prefix_len = Some(prefix_len);
        self
    }

    /// Run with a LoRA adapter.
    pub fn with_lora(mut self, lora_id: u64) -> Self {
        self.lora_id = Some(lora_id);
        self
    }

    /// Input length.
    pub fn input_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether this is an embedding request.
    pub fn is_embedding(&self) -> bool {
        matches!(self.kind, StreamKind::Embedding)
    }
}

/// Terminal result of a successful stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutput {
    /// Generated tokens (empty for embeddings).
    pub output_ids: Vec<u32>,
    /// Embedding vector (embedding streams only).
    pub embedding: Option<Vec<f32>>,
    /// Why the stream finished.
    pub finish_reason: FinishReason,
    /// Rounds in which the stream contributed a row.
    pub iter_count: usize,
    /// Input length.
    pub input_len: usize,
    /// Input positions served from the prefix cache.
    pub reuse_len: usize,
    /// Time from submission to completion.
    pub cost: Duration,
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    output_ids: Vec<u32>,
    embedding: Option<Vec<f32>>,
    finish_reason: Option<FinishReason>,
    error: Option<StreamError>,
    /// Cache handle.
    block_table: BlockTable,
    /// Positions whose KV is already in the cache.
    computed_len: usize,
    /// Input positions served by prefix reuse.
    reuse_len: usize,
    /// Copies to run before this stream's next row.
    pending_copies: Vec<BlockCopy>,
    iter_count: usize,
    finished_at: Option<Instant>,
}

/// A single request plus its accumulating output and wait state.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    request: StreamRequest,
    submitted_at: Instant,
    inner: Mutex<StreamInner>,
    done: Condvar,
}

impl Stream {
    /// Create a waiting stream.
    pub fn new(id: StreamId, request: StreamRequest, block_size: usize) -> Self {
        Self {
            id,
            request,
            submitted_at: Instant::now(),
            inner: Mutex::new(StreamInner {
                state: StreamState::Waiting,
                output_ids: Vec::new(),
                embedding: None,
                finish_reason: None,
                error: None,
                block_table: BlockTable::new(block_size),
                computed_len: 0,
                reuse_len: 0,
                pending_copies: Vec::new(),
                iter_count: 0,
                finished_at: None,
            }),
            done: Condvar::new(),
        }
    }

    // ========== Request ==========

    /// Get the stream ID.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The submitted request.
    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Input token IDs.
    pub fn input_ids(&self) -> &[u32] {
        &self.request.token_ids
    }

    /// Input length.
    pub fn input_len(&self) -> usize {
        self.request.input_len()
    }

    /// Whether this is an embedding stream.
    pub fn is_embedding(&self) -> bool {
        self.request.is_embedding()
    }

    /// Generation settings (None for embeddings).
    pub fn generate_config(&self) -> Option<&GenerateConfig> {
        match &self.request.kind {
            StreamKind::Generate(config) => Some(config),
            StreamKind::Embedding => None,
        }
    }

    /// Requested LoRA adapter.
    pub fn lora_id(&self) -> Option<u64> {
        self.request.lora_id
    }

    // ========== Progress ==========

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Whether the stream reached Finished or Errored.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Snapshot of the generated tokens.
    pub fn output_ids(&self) -> Vec<u32> {
        self.inner.lock().output_ids.clone()
    }

    /// Input plus output length.
    pub fn seq_len(&self) -> usize {
        self.input_len() + self.inner.lock().output_ids.len()
    }

    /// Positions already computed into the cache.
    pub fn computed_len(&self) -> usize {
        self.inner.lock().computed_len
    }

    /// Whether the input still has uncomputed positions.
    pub fn in_context_phase(&self) -> bool {
        self.inner.lock().computed_len < self.input_len()
    }

    /// Recorded error, if Errored.
    pub fn error(&self) -> Option<StreamError> {
        self.inner.lock().error.clone()
    }

    /// Snapshot of the blocks this stream holds.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.inner.lock().block_table.get_physical_block_ids().to_vec()
    }

    /// Number of blocks this stream holds.
    pub fn num_blocks(&self) -> usize {
        self.inner.lock().block_table.num_blocks()
    }

    // ========== Engine-side mutation ==========

    /// Bind the stream's input to cache blocks and move it to Running.
    ///
    /// Reused prefix positions count as already computed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidStateTransition`] unless the stream is Waiting.
    /// - [`Error::CacheExhausted`] if the pool cannot hold the input; the
    ///   stream stays Waiting and holds nothing.
    pub fn admit(&self, cache: &CacheManager) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Waiting {
            return Err(Error::InvalidStateTransition {
                from: inner.state.as_str(),
                to: "Running",
            });
        }
        let admission = cache.admit(
            &mut inner.block_table,
            &self.request.token_ids,
            self.request.prefix_len,
        )?;
        inner.computed_len = admission.reuse_len;
        inner.reuse_len = admission.reuse_len;
        inner.pending_copies = admission.copies;
        inner.state = StreamState::Running;
        Ok(())
    }

    /// Run `f` on the cache handle under the stream lock.
    pub fn with_block_table<R>(&self, f: impl FnOnce(&mut BlockTable) -> R) -> R {
        f(&mut self.inner.lock().block_table)
    }

    /// Return every held block to the pool.
    pub fn release_cache(&self, cache: &CacheManager) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.pending_copies.clear();
        cache.release(&mut inner.block_table)
    }

    /// Queue block copies for the next round.
    pub fn push_copies(&self, copies: Vec<BlockCopy>) {
        self.inner.lock().pending_copies.extend(copies);
    }

    /// Take the queued block copies.
    pub fn take_copies(&self) -> Vec<BlockCopy> {
        std::mem::take(&mut self.inner.lock().pending_copies)
    }

    /// Mark `num_positions` more positions as computed.
    pub fn advance_computed(&self, num_positions: usize) {
        let mut inner = self.inner.lock();
        inner.computed_len += num_positions;
    }

    /// Count one round in which this stream contributed a row.
    pub fn record_iteration(&self) {
        self.inner.lock().iter_count += 1;
    }

    /// Running -> Paused.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not Running.
    pub fn set_paused(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Running => {
                inner.state = StreamState::Paused;
                Ok(())
            }
            StreamState::Paused => Ok(()),
            state => Err(Error::InvalidStateTransition {
                from: state.as_str(),
                to: "Paused",
            }),
        }
    }

    /// Paused -> Running.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not admitted.
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Running | StreamState::Paused => {
                inner.state = StreamState::Running;
                Ok(())
            }
            state => Err(Error::InvalidStateTransition {
                from: state.as_str(),
                to: "Running",
            }),
        }
    }

    /// Append one generated token.
    ///
    /// Returns the finish reason if the token completes the stream; the
    /// caller is expected to [`finish`](Self::finish) it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the stream is already terminal.
    pub fn append_output(&self, token_id: u32, max_seq_len: usize) -> Result<Option<FinishReason>> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(Error::InvalidState {
                stream_id: self.id,
                state: inner.state.as_str(),
                operation: "append output",
            });
        }
        inner.output_ids.push(token_id);
        Ok(self.need_finish(&inner.output_ids, max_seq_len))
    }

    /// Store the embedding vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the stream is already terminal.
    pub fn set_embedding(&self, embedding: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(Error::InvalidState {
                stream_id: self.id,
                state: inner.state.as_str(),
                operation: "set embedding",
            });
        }
        inner.embedding = Some(embedding);
        Ok(())
    }

    /// Whether the current output already satisfies a stop condition.
    pub fn stop_reason(&self, max_seq_len: usize) -> Option<FinishReason> {
        let inner = self.inner.lock();
        self.need_finish(&inner.output_ids, max_seq_len)
    }

    /// Transition to Finished and wake waiters.
    ///
    /// Returns `false` (and changes nothing) if the stream was already
    /// terminal.
    pub fn finish(&self, reason: FinishReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = StreamState::Finished;
        inner.finish_reason = Some(reason);
        inner.finished_at = Some(Instant::now());
        self.done.notify_all();
        true
    }

    /// Transition to Errored with `error` and wake waiters.
    ///
    /// Returns `false` (and changes nothing) if the stream was already
    /// terminal.
    pub fn set_error(&self, error: impl Into<StreamError>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = StreamState::Errored;
        inner.error = Some(error.into());
        inner.finished_at = Some(Instant::now());
        self.done.notify_all();
        true
    }

    // ========== Caller-side waiting ==========

    /// Block until the stream is terminal and return its outcome.
    pub fn wait_finish(&self) -> std::result::Result<StreamOutput, StreamError> {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.done.wait(&mut inner);
        }
        self.outcome(&inner)
    }

    /// Like [`wait_finish`](Self::wait_finish), giving up after `timeout`.
    ///
    /// Returns `None` on timeout; the stream keeps running.
    pub fn wait_finish_timeout(
        &self,
        timeout: Duration,
    ) -> Option<std::result::Result<StreamOutput, StreamError>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            if self.done.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.state.is_terminal().then(|| self.outcome(&inner))
    }

    /// Outcome without blocking, if terminal.
    pub fn try_output(&self) -> Option<std::result::Result<StreamOutput, StreamError>> {
        let inner = self.inner.lock();
        inner.state.is_terminal().then(|| self.outcome(&inner))
    }

    fn outcome(&self, inner: &StreamInner) -> std::result::Result<StreamOutput, StreamError> {
        if let Some(error) = &inner.error {
            return Err(error.clone());
        }
        let finished_at = inner.finished_at.unwrap_or_else(Instant::now);
        Ok(StreamOutput {
            output_ids: inner.output_ids.clone(),
            embedding: inner.embedding.clone(),
            finish_reason: inner.finish_reason.unwrap_or(FinishReason::MaxTokens),
            iter_count: inner.iter_count,
            input_len: self.input_len(),
            reuse_len: inner.reuse_len,
            cost: finished_at.duration_since(self.submitted_at),
        })
    }

    /// Stop conditions of a generation stream given its output so far.
    fn need_finish(&self, output_ids: &[u32], max_seq_len: usize) -> Option<FinishReason> {
        let config = self.generate_config()?;
        let seq_len = self.input_len() + output_ids.len();

        if output_ids.len() >= config.min_new_tokens {
            if let Some(last) = output_ids.last() {
                if config.stop_token_ids.contains(last) {
                    return Some(FinishReason::StopToken);
                }
            }
            let hit = config
                .stop_sequences
                .iter()
                .any(|seq| !seq.is_empty() && output_ids.ends_with(seq));
            if hit {
                return Some(FinishReason::StopSequence);
            }
        }

        let token_limit = self.input_len() + config.max_new_tokens;
        if seq_len >= max_seq_len && max_seq_len < token_limit {
            return Some(FinishReason::MaxSeqLen);
        }
        if seq_len >= token_limit {
            return Some(FinishReason::MaxTokens);
        }
        None
    }
}
