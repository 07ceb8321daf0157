//! Integration tests for Stream.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nano_batch::core::stream::{Stream, StreamRequest, StreamState};
use nano_batch::{CacheConfig, CacheManager, Error, ErrorCode, FinishReason, GenerateConfig};

fn cache(num_blocks: usize) -> CacheManager {
    CacheManager::new(&CacheConfig {
        block_size: 4,
        num_blocks,
        enable_reuse: false,
        enable_prefix_eviction: true,
    })
}

#[test]
fn test_admit_binds_input_blocks() {
    let cache = cache(8);
    let stream = Stream::new(
        1,
        StreamRequest::generate(vec![1, 2, 3, 4, 5], GenerateConfig::greedy(4)),
        4,
    );

    stream.admit(&cache).unwrap();
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(stream.num_blocks(), 2);
    assert_eq!(stream.computed_len(), 0);
    assert_eq!(cache.num_free_blocks(), 6);

    // A second admit is a state error and takes nothing
    assert!(matches!(
        stream.admit(&cache),
        Err(Error::InvalidStateTransition { .. })
    ));
    assert_eq!(cache.num_free_blocks(), 6);

    assert_eq!(stream.release_cache(&cache).unwrap(), 2);
    assert_eq!(stream.num_blocks(), 0);
    assert_eq!(cache.num_free_blocks(), 8);
}

#[test]
fn test_admit_exhaustion_leaves_stream_waiting() {
    let cache = cache(1);
    let stream = Stream::new(1, StreamRequest::embedding((0..9).collect()), 4);

    assert!(matches!(
        stream.admit(&cache),
        Err(Error::CacheExhausted { .. })
    ));
    assert_eq!(stream.state(), StreamState::Waiting);
    assert_eq!(stream.num_blocks(), 0);
    assert_eq!(cache.num_free_blocks(), 1);
}

#[test]
fn test_pause_and_resume() {
    let cache = cache(4);
    let stream = Stream::new(1, StreamRequest::embedding(vec![1, 2]), 4);

    // Only admitted streams can pause
    assert!(stream.set_paused().is_err());

    stream.admit(&cache).unwrap();
    stream.set_paused().unwrap();
    assert_eq!(stream.state(), StreamState::Paused);
    assert!(stream.state().is_admitted());

    stream.resume().unwrap();
    assert_eq!(stream.state(), StreamState::Running);
}

#[test]
fn test_stop_sequence_respects_min_new_tokens() {
    let config = GenerateConfig {
        min_new_tokens: 3,
        stop_sequences: vec![vec![7, 8]],
        ..GenerateConfig::greedy(10)
    };
    let stream = Stream::new(1, StreamRequest::generate(vec![1], config), 4);

    assert_eq!(stream.append_output(7, 100).unwrap(), None);
    // Output ends with the stop sequence, but only 2 tokens so far
    assert_eq!(stream.append_output(8, 100).unwrap(), None);
    assert_eq!(stream.append_output(7, 100).unwrap(), None);
    assert_eq!(
        stream.append_output(8, 100).unwrap(),
        Some(FinishReason::StopSequence)
    );
}

#[test]
fn test_first_terminal_outcome_wins() {
    let stream = Stream::new(1, StreamRequest::embedding(vec![1]), 4);

    assert!(stream.set_error(Error::Compute("boom".to_string())));
    assert!(!stream.finish(FinishReason::Embedded));
    assert!(!stream.set_error(Error::EngineStopped));

    let err = stream.wait_finish().unwrap_err();
    assert_eq!(err.code, ErrorCode::Compute);
    assert_eq!(stream.state(), StreamState::Errored);

    // Terminal streams reject further output
    assert!(stream.append_output(3, 100).is_err());
    assert!(stream.set_embedding(vec![0.0]).is_err());
}

#[test]
fn test_waiters_on_other_threads_wake_on_finish() {
    let stream = Arc::new(Stream::new(
        1,
        StreamRequest::generate(vec![1, 2], GenerateConfig::greedy(1)),
        4,
    ));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let stream = Arc::clone(&stream);
            thread::spawn(move || stream.wait_finish())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    stream.append_output(42, 100).unwrap();
    assert!(stream.finish(FinishReason::MaxTokens));

    for waiter in waiters {
        let output = waiter.join().unwrap().unwrap();
        assert_eq!(output.output_ids, vec![42]);
        assert_eq!(output.finish_reason, FinishReason::MaxTokens);
        assert_eq!(output.input_len, 2);
    }
}

#[test]
fn test_wait_timeout_does_not_terminate() {
    let stream = Stream::new(1, StreamRequest::embedding(vec![1]), 4);

    assert!(stream
        .wait_finish_timeout(Duration::from_millis(10))
        .is_none());
    assert_eq!(stream.state(), StreamState::Waiting);

    stream.set_embedding(vec![0.5, 0.25]).unwrap();
    stream.finish(FinishReason::Embedded);
    let output = stream
        .wait_finish_timeout(Duration::from_millis(10))
        .unwrap()
        .unwrap();
    assert_eq!(output.embedding, Some(vec![0.5, 0.25]));
    assert!(output.output_ids.is_empty());
}
