//! The engine: owns the components and runs the step loop on its own thread.
//!
//! ## Engine Flow
//!
//! ```text
//!  caller threads                      engine thread
//!  ──────────────                      ─────────────
//!  enqueue(request) ──► scheduler ──►  loop {
//!        │                               batch = schedule_new()   (parks when idle)
//!        ▼                               if batch empty: break    (stopped)
//!  handle.wait_finish()                  executor.process(batch)
//!        ▲                               check cache invariants
//!        └──────── stream wake-up ────  }
//!                                        error all leftover streams (EngineStopped)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::cache_manager::{CacheManager, CacheStats};
use crate::core::stream::{Stream, StreamHandle, StreamRequest};
use crate::engine::compute::ComputeBackend;
use crate::engine::executor::Executor;
use crate::engine::lora::{AdapterId, LoraAdapter, LoraRegistry};
use crate::error::{Error, Result};
use crate::scheduler::FifoScheduler;

/// Continuous-batching engine.
///
/// # Example
///
/// ```
/// use nano_batch::engine::{Engine, SyntheticBackend};
/// use nano_batch::{EngineConfig, GenerateConfig, StreamRequest};
///
/// let config = EngineConfig::default().with_pool(16, 4);
/// let engine = Engine::new(config, Box::new(SyntheticBackend::new(64, 8))).unwrap();
///
/// let handle = engine.enqueue(StreamRequest::generate(vec![1, 2, 3], GenerateConfig::greedy(4)));
/// let output = handle.wait_finish().unwrap();
/// assert_eq!(output.output_ids.len(), 4);
///
/// engine.stop();
/// ```
pub struct Engine {
    config: EngineConfig,
    cache: Arc<CacheManager>,
    scheduler: Arc<FifoScheduler>,
    adapters: Arc<LoraRegistry>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the cache, scheduler and executor, then start the loop thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Io`] if the thread cannot be spawned.
    pub fn new(config: EngineConfig, backend: Box<dyn ComputeBackend>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheManager::new(&config.cache));
        let scheduler = Arc::new(FifoScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&cache),
        ));
        let adapters = Arc::new(LoraRegistry::new());
        let executor = Executor::new(&config, Arc::clone(&cache), Arc::clone(&adapters), backend);

        let worker = {
            let cache = Arc::clone(&cache);
            let scheduler = Arc::clone(&scheduler);
            let verify = config.verify_cache_invariants;
            std::thread::Builder::new()
                .name("nano-batch-engine".to_string())
                .spawn(move || run_loop(executor, &scheduler, &cache, verify))?
        };

        info!(
            num_blocks = config.cache.num_blocks,
            block_size = config.cache.block_size,
            max_running_streams = config.scheduler.max_running_streams,
            reuse = config.cache.enable_reuse,
            "engine started"
        );

        Ok(Self {
            config,
            cache,
            scheduler,
            adapters,
            next_id: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Submit a request. Never fails: after [`stop`](Self::stop) the
    /// returned stream is already Errored with [`Error::SchedulerStopped`].
    pub fn enqueue(&self, request: StreamRequest) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(Stream::new(id, request, self.config.cache.block_size));
        if let Err(err) = self.scheduler.enqueue(Arc::clone(&stream)) {
            debug!(stream_id = id, error = %err, "enqueue rejected");
            stream.set_error(err);
        }
        stream
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    ///
    /// Waiting streams and streams still admitted when the loop exits are
    /// Errored with [`Error::EngineStopped`].
    pub fn stop(&self) {
        self.scheduler.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("engine thread panicked");
            }
            info!("engine stopped");
        }
    }

    /// Whether the loop thread is still running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Register a LoRA adapter.
    pub fn add_lora(&self, adapter: LoraAdapter) {
        self.adapters.add(adapter);
    }

    /// Remove a LoRA adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterNotFound`] if the id is unknown.
    pub fn remove_lora(&self, id: AdapterId) -> Result<()> {
        self.adapters.remove(id).map(|_| ())
    }

    /// Cache pool occupancy.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Streams waiting for admission.
    pub fn num_waiting(&self) -> usize {
        self.scheduler.num_waiting()
    }

    /// Admitted streams not yet terminal.
    pub fn num_running(&self) -> usize {
        self.scheduler.num_running()
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("cache", &self.cache.stats())
            .field("waiting", &self.scheduler.num_waiting())
            .finish_non_exhaustive()
    }
}

/// Runs [`shutdown`] when the loop exits, including by panic.
struct Teardown<'a> {
    scheduler: &'a FifoScheduler,
    cache: &'a CacheManager,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("engine loop panicked, failing in-flight streams");
        }
        shutdown(self.scheduler, self.cache);
    }
}

/// Schedule, execute, verify; until stopped or a fatal error.
fn run_loop(mut executor: Executor, scheduler: &FifoScheduler, cache: &CacheManager, verify: bool) {
    let _teardown = Teardown { scheduler, cache };
    info!("engine loop started");
    let mut rounds: u64 = 0;

    loop {
        let batch = match scheduler.schedule_new() {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "scheduling failed, stopping engine");
                break;
            }
        };
        if batch.is_empty() {
            break;
        }

        rounds += 1;
        match executor.process(&batch) {
            Ok(summary) => debug!(
                round = rounds,
                generate_rows = summary.generate_rows,
                context_rows = summary.context_rows,
                paused = summary.paused,
                finished = summary.finished,
                errored = summary.errored,
                "round complete"
            ),
            Err(err) if err.is_fatal() => {
                error!(round = rounds, error = %err, "fatal error, stopping engine");
                break;
            }
            Err(err) => warn!(round = rounds, error = %err, "round failed"),
        }

        if verify {
            if let Err(err) = cache.check_invariants(&scheduler.running_holdings()) {
                error!(round = rounds, error = %err, "cache invariant violated, stopping engine");
                break;
            }
        }
    }

    info!(rounds, "engine loop exited");
}

/// Fail everything still in flight so no caller blocks forever.
fn shutdown(scheduler: &FifoScheduler, cache: &CacheManager) {
    scheduler.stop();
    for stream in scheduler.drain_running() {
        if let Err(err) = stream.release_cache(cache) {
            warn!(stream_id = stream.id(), error = %err, "release during shutdown failed");
        }
        if stream.set_error(Error::EngineStopped) {
            debug!(stream_id = stream.id(), "stream stopped in flight");
        }
    }
}
