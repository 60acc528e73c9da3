
use std::time::Duration;

use fixtures::*;
use submitter_executors::nonce_queue::{NonceQueue, NonceQueueConfig, QueueError};

fn config() -> NonceQueueConfig {
    NonceQueueConfig {
        max_pending_per_track: 10,
        max_total_pending: 100,
        max_in_flight: 10,
        max_pending_time: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn test_requests_run_in_nonce_order() {
    setup_tracing();
    let processor = TestProcessor::with_delay(Duration::from_millis(10));
    let queue = NonceQueue::new(MockNonceSource::default(), processor.clone(), config());
    let track = track(1);

    let results = futures::future::join_all([1, 3, 2, 0].map(|nonce| {
        let queue = queue.clone();
        async move { queue.enqueue(request(track, nonce, "boop")).await }
    }))
    .await;

    for result in results {
        assert!(result.unwrap().consumed);
    }
    assert_eq!(processor.processed_nonces(), vec![0, 1, 2, 3]);
    assert_eq!(queue.buffered(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_track_starts_from_chain_nonce() {
    let source = MockNonceSource::default();
    source.set_nonce(track(1), 7);
    let processor = TestProcessor::default();
    let queue = NonceQueue::new(source, processor.clone(), config());

    let output = queue.enqueue(request(track(1), 7, "boop")).await.unwrap();
    assert_eq!(output.nonce, 7);

    let err = queue.enqueue(request(track(1), 7, "again")).await.unwrap_err();
    assert_eq!(
        err,
        QueueError::NonceOutOfRange {
            nonce: 7,
            next_nonce: 8,
            window: 10
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_local_nonce_outlives_empty_track() {
    let source = MockNonceSource::default();
    let queue = NonceQueue::new(source.clone(), TestProcessor::default(), config());

    queue.enqueue(request(track(1), 0, "first")).await.unwrap();
    // The chain has not caught up yet, the queue keeps counting locally
    queue.enqueue(request(track(1), 1, "second")).await.unwrap();

    assert_eq!(source.fetches(), 1);
    assert_eq!(queue.buffered(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nonce_too_far_ahead_is_rejected() {
    let queue = NonceQueue::new(MockNonceSource::default(), TestProcessor::default(), config());

    let err = queue.enqueue(request(track(1), 11, "far")).await.unwrap_err();
    assert!(matches!(err, QueueError::NonceOutOfRange { nonce: 11, next_nonce: 0, .. }));

    // The edge of the window is still accepted and waits for its predecessors
    let waiting = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 10, "edge")).await }
    });
    settle().await;
    assert_eq!(queue.buffered(), 1);
    assert!(!waiting.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_window_follows_per_track_capacity() {
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        TestProcessor::default(),
        NonceQueueConfig {
            max_pending_per_track: 4,
            ..config()
        },
    );

    let err = queue.enqueue(request(track(1), 100, "far")).await.unwrap_err();
    assert_eq!(
        err,
        QueueError::NonceOutOfRange {
            nonce: 100,
            next_nonce: 0,
            window: 4
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_last_representable_nonce_is_rejected() {
    let source = MockNonceSource::default();
    source.set_nonce(track(1), u64::MAX - 1);
    let queue = NonceQueue::new(source, TestProcessor::default(), config());

    let output = queue.enqueue(request(track(1), u64::MAX - 1, "last")).await.unwrap();
    assert!(output.consumed);

    let err = queue.enqueue(request(track(1), u64::MAX, "overflow")).await.unwrap_err();
    assert_eq!(
        err,
        QueueError::NonceOutOfRange {
            nonce: u64::MAX,
            next_nonce: u64::MAX,
            window: 10
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_buffer_exceeded_per_track() {
    let processor = TestProcessor::with_delay(Duration::from_secs(10));
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor.clone(),
        NonceQueueConfig {
            max_pending_per_track: 2,
            ..config()
        },
    );

    for nonce in [0, 1] {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(request(track(1), nonce, "boop")).await });
    }
    settle().await;
    assert_eq!(queue.buffered(), 2);

    let err = queue.enqueue(request(track(1), 2, "boop")).await.unwrap_err();
    assert_eq!(err, QueueError::BufferExceeded);

    // Other tracks are unaffected
    let other = queue.enqueue(request(track(2), 0, "boop")).await.unwrap();
    assert_eq!(other.nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_over_capacity_prunes_busiest_track() {
    setup_tracing();
    let processor = TestProcessor::with_delay(Duration::from_secs(10));
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor.clone(),
        NonceQueueConfig {
            max_total_pending: 4,
            ..config()
        },
    );

    let busy: Vec<_> = [0, 1, 2, 3]
        .map(|nonce| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(request(track(1), nonce, "busy")).await })
        })
        .into_iter()
        .collect();
    settle().await;
    assert_eq!(queue.buffered(), 4);

    let newcomer = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(2), 0, "new")).await }
    });

    let mut results = Vec::new();
    for handle in busy {
        results.push(handle.await.unwrap());
    }

    // The executing head is never pruned
    assert_eq!(results[0].as_ref().unwrap().nonce, 0);
    for pruned in &results[1..] {
        assert_eq!(*pruned, Err(QueueError::Pruned));
    }

    let newcomer = newcomer.await.unwrap().unwrap();
    assert_eq!(newcomer.payload, "new");
}

#[tokio::test(start_paused = true)]
async fn test_over_capacity_without_anything_to_prune() {
    let processor = TestProcessor::with_delay(Duration::from_secs(10));
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor,
        NonceQueueConfig {
            max_total_pending: 1,
            ..config()
        },
    );

    tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 0, "busy")).await }
    });
    settle().await;

    let err = queue.enqueue(request(track(2), 0, "new")).await.unwrap_err();
    assert_eq!(err, QueueError::OverCapacity);
}

#[tokio::test(start_paused = true)]
async fn test_tracks_run_in_parallel() {
    let processor = TestProcessor::with_delay(Duration::from_secs(1));
    let queue = NonceQueue::new(MockNonceSource::default(), processor.clone(), config());

    let results = futures::future::join_all((1..=4).map(|byte| {
        let queue = queue.clone();
        async move { queue.enqueue(request(track(byte), 0, "boop")).await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(processor.max_in_flight(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_max_in_flight_is_respected() {
    let processor = TestProcessor::with_delay(Duration::from_secs(1));
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor.clone(),
        NonceQueueConfig {
            max_in_flight: 2,
            ..config()
        },
    );

    let results = futures::future::join_all((1..=5).map(|byte| {
        let queue = queue.clone();
        async move { queue.enqueue(request(track(byte), 0, "boop")).await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(processor.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_same_track_never_runs_concurrently() {
    let processor = TestProcessor::with_delay(Duration::from_millis(100));
    let queue = NonceQueue::new(MockNonceSource::default(), processor.clone(), config());

    let results = futures::future::join_all((0..5).map(|nonce| {
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), nonce, "boop")).await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(processor.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_nonce_replaces_waiting_request() {
    let processor = TestProcessor::with_delay(Duration::from_millis(100));
    let queue = NonceQueue::new(MockNonceSource::default(), processor.clone(), config());

    let first = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 1, "original")).await }
    });
    settle().await;

    let second = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 1, "replacement")).await }
    });
    settle().await;

    assert_eq!(first.await.unwrap(), Err(QueueError::Replaced));
    assert_eq!(queue.buffered(), 1);

    queue.enqueue(request(track(1), 0, "head")).await.unwrap();
    let output = second.await.unwrap().unwrap();
    assert_eq!(output.payload, "replacement");
    assert_eq!(processor.processed_nonces(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_executing_nonce_cannot_be_replaced() {
    let processor = TestProcessor::with_delay(Duration::from_secs(1));
    let queue = NonceQueue::new(MockNonceSource::default(), processor, config());

    let head = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 0, "head")).await }
    });
    settle().await;

    let err = queue.enqueue(request(track(1), 0, "again")).await.unwrap_err();
    assert_eq!(err, QueueError::NonceInFlight { nonce: 0 });
    assert_eq!(head.await.unwrap().unwrap().payload, "head");
}

#[tokio::test(start_paused = true)]
async fn test_waiting_request_times_out() {
    let processor = TestProcessor::default();
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor.clone(),
        NonceQueueConfig {
            max_pending_time: Duration::from_secs(5),
            ..config()
        },
    );

    // Nonce 0 never shows up
    let err = queue.enqueue(request(track(1), 1, "gap")).await.unwrap_err();
    assert!(matches!(err, QueueError::PendingTimeout { waited_ms } if waited_ms >= 5_000));
    assert_eq!(queue.buffered(), 0);
    assert!(processor.processed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_head_times_out_waiting_for_execution_slot() {
    let processor = TestProcessor::with_delay(Duration::from_secs(10));
    let queue = NonceQueue::new(
        MockNonceSource::default(),
        processor.clone(),
        NonceQueueConfig {
            max_in_flight: 1,
            max_pending_time: Duration::from_secs(2),
            ..config()
        },
    );

    let busy = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 0, "busy")).await }
    });
    settle().await;

    let err = queue.enqueue(request(track(2), 0, "starved")).await.unwrap_err();
    assert!(matches!(err, QueueError::PendingTimeout { .. }));
    assert!(busy.await.unwrap().is_ok());
    assert_eq!(processor.processed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unconsumed_nonce_resyncs_track() {
    let source = MockNonceSource::default();
    let processor = TestProcessor::with_delay(Duration::from_millis(10));
    processor.fail_once(0);
    let queue = NonceQueue::new(source.clone(), processor.clone(), config());

    let next = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 1, "next")).await }
    });

    let failed = queue.enqueue(request(track(1), 0, "first")).await.unwrap();
    assert!(!failed.consumed);
    settle().await;

    // Chain still expects 0, so nonce 1 keeps waiting
    assert_eq!(source.fetches(), 2);
    assert!(!next.is_finished());

    queue.enqueue(request(track(1), 0, "retry")).await.unwrap();
    assert_eq!(next.await.unwrap().unwrap().nonce, 1);
    assert_eq!(processor.processed_nonces(), vec![0, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_resync_drops_requests_below_chain_nonce() {
    let source = MockNonceSource::default();
    let processor = TestProcessor::with_delay(Duration::from_millis(10));
    processor.fail_once(0);
    let queue = NonceQueue::new(source.clone(), processor.clone(), config());

    let stale = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 1, "stale")).await }
    });
    let ready = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 2, "ready")).await }
    });
    settle().await;

    // Something else moved the account to nonce 2 in the meantime
    source.set_nonce(track(1), 2);
    queue.enqueue(request(track(1), 0, "first")).await.unwrap();

    assert!(matches!(
        stale.await.unwrap(),
        Err(QueueError::NonceOutOfRange { nonce: 1, next_nonce: 2, .. })
    ));
    assert_eq!(ready.await.unwrap().unwrap().nonce, 2);
}

#[tokio::test(start_paused = true)]
async fn test_processor_panic_is_reported() {
    let processor = TestProcessor::default();
    processor.panic_once(0);
    let queue = NonceQueue::new(MockNonceSource::default(), processor.clone(), config());

    let err = queue.enqueue(request(track(1), 0, "boom")).await.unwrap_err();
    assert!(matches!(err, QueueError::ProcessorFailed { .. }));

    // The track survives and the nonce is still expected
    let output = queue.enqueue(request(track(1), 0, "retry")).await.unwrap();
    assert_eq!(output.payload, "retry");
}

#[tokio::test(start_paused = true)]
async fn test_nonce_fetch_failure_rejects_request() {
    let source = MockNonceSource::default();
    source.set_failing(true);
    let queue = NonceQueue::new(source.clone(), TestProcessor::default(), config());

    let err = queue.enqueue(request(track(1), 0, "boop")).await.unwrap_err();
    assert!(matches!(err, QueueError::NonceFetch { .. }));
    assert_eq!(queue.buffered(), 0);

    source.set_failing(false);
    assert!(queue.enqueue(request(track(1), 0, "boop")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_nonce_fetch() {
    let source = MockNonceSource::with_delay(Duration::from_millis(50));
    let queue = NonceQueue::new(source.clone(), TestProcessor::default(), config());

    let results = futures::future::join_all((0..3).map(|nonce| {
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), nonce, "boop")).await }
    }))
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_for_lists_account_requests() {
    let processor = TestProcessor::with_delay(Duration::from_secs(10));
    let queue = NonceQueue::new(MockNonceSource::default(), processor, config());

    for nonce in [0, 2] {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(request(track(1), nonce, "boop")).await });
    }
    tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(2), 0, "other")).await }
    });
    settle().await;

    let pending = queue.pending_for(account(1));
    assert_eq!(pending.len(), 2);
    assert_eq!((pending[0].nonce_value, pending[0].executing), (0, true));
    assert_eq!((pending[1].nonce_value, pending[1].executing), (2, false));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_waiting_requests() {
    let processor = TestProcessor::with_delay(Duration::from_secs(1));
    let queue = NonceQueue::new(MockNonceSource::default(), processor, config());

    let head = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 0, "head")).await }
    });
    let waiting = tokio::spawn({
        let queue = queue.clone();
        async move { queue.enqueue(request(track(1), 2, "waiting")).await }
    });
    settle().await;

    queue.shutdown();

    assert_eq!(waiting.await.unwrap(), Err(QueueError::Shutdown));
    assert!(head.await.unwrap().is_ok());
    assert_eq!(
        queue.enqueue(request(track(1), 1, "late")).await,
        Err(QueueError::Shutdown)
    );
}
