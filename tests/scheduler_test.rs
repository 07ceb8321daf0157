//! Integration tests for the FIFO scheduler driving the executor.

use std::sync::Arc;
use std::thread;

use nano_batch::core::stream::{Stream, StreamHandle, StreamRequest, StreamState};
use nano_batch::engine::{Executor, LoraRegistry};
use nano_batch::{
    CacheManager, EngineConfig, ErrorCode, FifoScheduler, FinishReason, GenerateConfig,
    SyntheticBackend,
};

struct Rig {
    cache: Arc<CacheManager>,
    scheduler: FifoScheduler,
    executor: Executor,
}

fn rig(num_blocks: usize, block_size: usize) -> Rig {
    let config = EngineConfig::default().with_pool(num_blocks, block_size);
    let cache = Arc::new(CacheManager::new(&config.cache));
    let scheduler = FifoScheduler::new(config.scheduler.clone(), Arc::clone(&cache));
    let executor = Executor::new(
        &config,
        Arc::clone(&cache),
        Arc::new(LoraRegistry::new()),
        Box::new(SyntheticBackend::new(64, 8)),
    );
    Rig {
        cache,
        scheduler,
        executor,
    }
}

fn generate(id: u64, input: Vec<u32>, max_new_tokens: usize) -> StreamHandle {
    Arc::new(Stream::new(
        id,
        StreamRequest::generate(input, GenerateConfig::greedy(max_new_tokens)),
        4,
    ))
}

impl Rig {
    fn round(&mut self) -> Vec<StreamHandle> {
        let batch = self.scheduler.schedule_new().unwrap();
        self.executor.process(&batch).unwrap();
        self.cache
            .check_invariants(&self.scheduler.running_holdings())
            .unwrap();
        batch
    }
}

#[test]
fn test_short_stream_finishes_first_and_pool_recovers() {
    // Pool of 4 blocks of 4 tokens
    let mut rig = rig(4, 4);
    let s1 = generate(1, vec![1, 2, 3], 3); // 6 positions -> 2 blocks
    let s2 = generate(2, vec![4], 1); // 2 positions -> 1 block

    rig.scheduler.enqueue(Arc::clone(&s1)).unwrap();
    rig.round();
    assert_eq!(s1.output_ids().len(), 1);

    // S2 arrives one round later and is admitted next to S1
    rig.scheduler.enqueue(Arc::clone(&s2)).unwrap();
    let batch = rig.round();
    assert_eq!(batch.len(), 2);
    assert_eq!(s2.state(), StreamState::Finished);
    assert_eq!(s1.state(), StreamState::Running);
    assert!(rig.cache.stats().used <= 3);

    rig.round();
    assert_eq!(s1.state(), StreamState::Finished);
    assert_eq!(
        s1.wait_finish().unwrap().finish_reason,
        FinishReason::MaxTokens
    );
    assert_eq!(rig.cache.num_free_blocks(), 4);
}

#[test]
fn test_blocked_head_is_retried_not_dropped() {
    let mut rig = rig(4, 4);
    let big = generate(1, (0..12).collect(), 1); // 3 blocks
    let blocked = generate(2, (0..8).collect(), 1); // 2 blocks
    rig.scheduler.enqueue(Arc::clone(&big)).unwrap();
    rig.scheduler.enqueue(Arc::clone(&blocked)).unwrap();

    let batch = rig.round();
    assert_eq!(batch.len(), 1);
    assert_eq!(big.state(), StreamState::Finished);
    assert_eq!(blocked.state(), StreamState::Waiting);

    rig.round();
    assert_eq!(blocked.state(), StreamState::Finished);
    assert_eq!(rig.cache.num_free_blocks(), 4);
}

#[test]
fn test_third_stream_waits_for_a_release() {
    // Pool of 2 blocks; each stream needs exactly one (2 input + 2 output)
    let mut rig = rig(2, 4);
    let streams: Vec<StreamHandle> = (0..3).map(|id| generate(id, vec![1, 2], 2)).collect();
    for stream in &streams {
        rig.scheduler.enqueue(Arc::clone(stream)).unwrap();
    }

    let batch = rig.round();
    let ids: Vec<u64> = batch.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(streams[2].state(), StreamState::Waiting);

    // Streams 0 and 1 produce their last token and release
    rig.round();
    assert_eq!(streams[0].state(), StreamState::Finished);
    assert_eq!(streams[2].state(), StreamState::Waiting);

    let batch = rig.round();
    let ids: Vec<u64> = batch.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![2]);
    assert_ne!(streams[2].state(), StreamState::Waiting);
}

#[test]
fn test_paused_stream_is_not_starved_by_arrivals() {
    let mut rig = rig(2, 4);
    // 4 input + 4 output positions: the whole pool by the end
    let long = generate(1, vec![1, 2, 3, 4], 4);
    rig.scheduler.enqueue(Arc::clone(&long)).unwrap();

    let mut was_paused = false;
    for round in 0..12u64 {
        // A short stream arrives every round
        rig.scheduler
            .enqueue(generate(100 + round, vec![5, 6, 7], 1))
            .unwrap();
        rig.round();
        was_paused |= long.state() == StreamState::Paused;
    }

    assert!(was_paused);
    let output = long.wait_finish().unwrap();
    assert_eq!(output.finish_reason, FinishReason::MaxTokens);
    assert_eq!(output.output_ids.len(), 4);
}

#[test]
fn test_queue_membership_is_exclusive() {
    let rig = rig(64, 4);
    let scheduler = Arc::new(rig.scheduler);

    let producers: Vec<_> = (0..4u64)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                for i in 0..5u64 {
                    scheduler.enqueue(generate(t * 10 + i, vec![1, 2], 2)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let batch = scheduler.schedule_new().unwrap();
    assert_eq!(batch.len() + scheduler.num_waiting(), 20);
    assert_eq!(scheduler.num_running(), batch.len());

    let mut ids: Vec<u64> = batch.iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), batch.len());
}

#[test]
fn test_stop_with_waiting_and_running() {
    let mut rig = rig(4, 4);
    let running = generate(1, (0..8).collect(), 100);
    let waiting = generate(2, (0..12).collect(), 1);
    rig.scheduler.enqueue(Arc::clone(&running)).unwrap();
    rig.round();
    rig.scheduler.enqueue(Arc::clone(&waiting)).unwrap();

    rig.scheduler.stop();
    assert!(rig.scheduler.schedule_new().unwrap().is_empty());
    assert_eq!(
        waiting.wait_finish().unwrap_err().code,
        ErrorCode::EngineStopped
    );

    // The engine fails what is left in flight
    for stream in rig.scheduler.drain_running() {
        stream.set_error(nano_batch::Error::EngineStopped);
        stream.release_cache(&rig.cache).unwrap();
    }
    assert_eq!(
        running.wait_finish().unwrap_err().code,
        ErrorCode::EngineStopped
    );
    assert_eq!(rig.cache.num_free_blocks(), 4);
}
