//! First-come-first-served admission scheduler.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   enqueue()                                 schedule_new()
//!       │                                           │
//!       ▼                                           ▼
//!  ┌─────────┐   head fits in the cache pool   ┌─────────┐
//!  │ Waiting │ ──────────────────────────────► │ Running │ ──► executor round
//!  │  Queue  │   (head that does not fit       │   Set   │
//!  └─────────┘    stays at the head)           └─────────┘
//!                                                   │
//!                        Finished / Errored ◄───────┘ (pruned next round)
//! ```
//!
//! The engine thread parks inside [`FifoScheduler::schedule_new`] while there
//! is nothing to run, and [`FifoScheduler::stop`] wakes it.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use nano_batch::core::cache_manager::CacheManager;
//! use nano_batch::core::stream::{Stream, StreamRequest};
//! use nano_batch::scheduler::FifoScheduler;
//! use nano_batch::{CacheConfig, GenerateConfig, SchedulerConfig};
//!
//! let cache = Arc::new(CacheManager::new(&CacheConfig {
//!     block_size: 4,
//!     num_blocks: 8,
//!     ..Default::default()
//! }));
//! let scheduler = FifoScheduler::new(SchedulerConfig::default(), Arc::clone(&cache));
//!
//! let stream = Arc::new(Stream::new(
//!     0,
//!     StreamRequest::generate(vec![1, 2, 3], GenerateConfig::greedy(4)),
//!     4,
//! ));
//! scheduler.enqueue(Arc::clone(&stream)).unwrap();
//!
//! let batch = scheduler.schedule_new().unwrap();
//! assert_eq!(batch.len(), 1);
//! assert_eq!(cache.num_free_blocks(), 7);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::block::BlockId;
use crate::core::cache_manager::CacheManager;
use crate::core::stream::{StreamHandle, StreamState};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    /// Streams not yet admitted, in submission order.
    waiting: VecDeque<StreamHandle>,
    /// Admitted streams (Running or Paused).
    running: Vec<StreamHandle>,
    stopped: bool,
}

/// FIFO scheduler with block-budget admission.
///
/// A stream is in at most one of the waiting queue and the running set.
#[derive(Debug)]
pub struct FifoScheduler {
    config: SchedulerConfig,
    cache: Arc<CacheManager>,
    state: Mutex<QueueState>,
    work_ready: Condvar,
}

impl FifoScheduler {
    /// Create a scheduler admitting against `cache`.
    pub fn new(config: SchedulerConfig, cache: Arc<CacheManager>) -> Self {
        Self {
            config,
            cache,
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
        }
    }

    /// Append a stream to the waiting queue and wake the engine loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerStopped`] after [`stop`](Self::stop).
    pub fn enqueue(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(Error::SchedulerStopped);
        }
        debug!(stream_id = stream.id(), input_len = stream.input_len(), "enqueued");
        state.waiting.push_back(stream);
        self.work_ready.notify_one();
        Ok(())
    }

    /// Wait until there is work or a stop request, then return the streams to
    /// run this round: everything already admitted plus newly admitted heads
    /// of the waiting queue.
    ///
    /// Returns an empty batch once stopped. Waiting streams are then Errored
    /// with [`Error::EngineStopped`].
    ///
    /// # Errors
    ///
    /// Only fatal cache errors are returned.
    pub fn schedule_new(&self) -> Result<Vec<StreamHandle>> {
        let mut state = self.state.lock();
        loop {
            state.running.retain(|s| !s.is_terminal());

            while !state.stopped && state.waiting.is_empty() && state.running.is_empty() {
                self.work_ready.wait(&mut state);
            }

            if state.stopped {
                Self::fail_waiting(&mut state);
                return Ok(Vec::new());
            }

            let admitted = self.admit_waiting(&mut state)?;
            if admitted > 0 {
                debug!(
                    admitted,
                    running = state.running.len(),
                    waiting = state.waiting.len(),
                    "admitted streams"
                );
            }

            if !state.running.is_empty() {
                return Ok(state.running.clone());
            }
        }
    }

    /// Stop admitting. Every waiting stream is Errored with
    /// [`Error::EngineStopped`] and the engine loop is woken. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        Self::fail_waiting(&mut state);
        self.work_ready.notify_all();
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Remove and return every admitted stream.
    pub fn drain_running(&self) -> Vec<StreamHandle> {
        std::mem::take(&mut self.state.lock().running)
    }

    /// Blocks held by each admitted stream.
    pub fn running_holdings(&self) -> Vec<Vec<BlockId>> {
        self.state
            .lock()
            .running
            .iter()
            .map(|s| s.block_ids())
            .collect()
    }

    /// Number of streams in the waiting queue.
    pub fn num_waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Number of admitted, non-terminal streams.
    pub fn num_running(&self) -> usize {
        self.state
            .lock()
            .running
            .iter()
            .filter(|s| !s.is_terminal())
            .count()
    }

    /// Admit heads of the waiting queue in order while they fit.
    ///
    /// Nothing is admitted while an admitted stream is Paused: blocks freed
    /// by finishing streams go to the paused ones first.
    fn admit_waiting(&self, state: &mut QueueState) -> Result<usize> {
        if state
            .running
            .iter()
            .any(|s| s.state() == StreamState::Paused)
        {
            return Ok(0);
        }
        let mut admitted = 0;
        while state.running.len() < self.config.max_running_streams {
            let Some(stream) = state.waiting.front().cloned() else {
                break;
            };
            if stream.state() != StreamState::Waiting {
                state.waiting.pop_front();
                continue;
            }

            if stream.input_len() == 0 {
                state.waiting.pop_front();
                stream.set_error(Error::InvalidState {
                    stream_id: stream.id(),
                    state: "Waiting",
                    operation: "admit an empty input",
                });
                continue;
            }

            let needed = self.cache.blocks_for(stream.input_len());
            if needed > self.cache.num_blocks() {
                state.waiting.pop_front();
                warn!(
                    stream_id = stream.id(),
                    needed,
                    capacity = self.cache.num_blocks(),
                    "input exceeds cache capacity"
                );
                stream.set_error(Error::ResourceUnavailable(format!(
                    "input needs {needed} blocks, pool holds {}",
                    self.cache.num_blocks()
                )));
                continue;
            }

            match stream.admit(&self.cache) {
                Ok(()) => {
                    state.waiting.pop_front();
                    state.running.push(stream);
                    admitted += 1;
                }
                Err(Error::CacheExhausted { requested, available }) => {
                    if state.running.is_empty() {
                        // Nothing running will ever release blocks.
                        state.waiting.pop_front();
                        stream.set_error(Error::ResourceUnavailable(format!(
                            "needs {requested} blocks, {available} can ever be freed"
                        )));
                        continue;
                    }
                    // Retry next round, keeping FIFO order.
                    break;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    state.waiting.pop_front();
                    stream.set_error(err);
                }
            }
        }
        Ok(admitted)
    }

    fn fail_waiting(state: &mut QueueState) {
        for stream in state.waiting.drain(..) {
            stream.set_error(Error::EngineStopped);
        }
    }
}
