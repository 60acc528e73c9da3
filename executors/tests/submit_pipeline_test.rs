
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use fixtures::*;
use submitter_core::error::SubmitterError;
use submitter_executors::block_watcher::{BlockWatcher, BlockWatcherConfig};
use submitter_executors::executor::ExecutorAssignment;
use submitter_executors::nonce_queue::{NonceQueue, NonceQueueConfig, SubmitRequest};
use submitter_executors::receipt::{ReceiptResolver, ReceiptResolverConfig};
use submitter_executors::submit::{ExecutionOutcome, ExecutionPath, RequestHash, SubmitPipeline};

#[derive(Debug, Clone)]
struct TestBoop {
    hash: B256,
}

impl RequestHash for TestBoop {
    fn request_hash(&self) -> B256 {
        self.hash
    }
}

/// Sends by "mining" the transaction: the receipt shows up in the next block.
#[derive(Clone)]
struct MockExecutionPath {
    connector: MockConnector,
    receipts: MockReceiptSource,
    rejected: Arc<Mutex<HashSet<u64>>>,
    silent: Arc<Mutex<HashSet<u64>>>,
    sent: Arc<Mutex<Vec<(Address, u64)>>>,
}

impl MockExecutionPath {
    fn new(connector: MockConnector, receipts: MockReceiptSource) -> Self {
        Self {
            connector,
            receipts,
            rejected: Default::default(),
            silent: Default::default(),
            sent: Default::default(),
        }
    }
}

impl ExecutionPath for MockExecutionPath {
    type Payload = TestBoop;

    async fn execute(
        &self,
        executor: Address,
        request: &SubmitRequest<TestBoop>,
    ) -> Result<B256, SubmitterError> {
        let nonce = request.nonce_value;
        if self.rejected.lock().unwrap().remove(&nonce) {
            return Err(SubmitterError::ValidationError {
                message: "execution reverted".to_string(),
            });
        }

        self.sent.lock().unwrap().push((executor, nonce));
        let transaction_hash = tx_hash(1_000 + nonce);

        if !self.silent.lock().unwrap().contains(&nonce) {
            let connector = self.connector.clone();
            let receipts = self.receipts.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                receipts.publish(transaction_hash, 100 + nonce);
                connector.push_block(block_with_txs(100 + nonce, vec![transaction_hash]));
            });
        }
        Ok(transaction_hash)
    }
}

struct Harness {
    queue: NonceQueue<MockNonceSource, SubmitPipeline<MockExecutionPath, MockReceiptSource>>,
    path: MockExecutionPath,
    nonces: MockNonceSource,
    _watcher: Arc<BlockWatcher>,
}

async fn setup() -> Harness {
    setup_tracing();
    let connector = MockConnector::default();
    let watcher = start_ws_watcher(&connector, BlockWatcherConfig::default()).await;

    let receipts = MockReceiptSource::default();
    let resolver = Arc::new(ReceiptResolver::new(
        receipts.clone(),
        &watcher,
        ReceiptResolverConfig::default(),
    ));
    let assignment = ExecutorAssignment::new([account(0xe1), account(0xe2)], Duration::from_secs(30)).unwrap();
    let path = MockExecutionPath::new(connector, receipts);

    let pipeline = SubmitPipeline::new(assignment, path.clone(), resolver)
        .with_receipt_timeout(Duration::from_secs(3));
    let nonces = MockNonceSource::default();
    let queue = NonceQueue::new(nonces.clone(), pipeline, NonceQueueConfig::default());

    Harness {
        queue,
        path,
        nonces,
        _watcher: watcher,
    }
}

fn boop(track: submitter_core::TrackKey, nonce: u64) -> SubmitRequest<TestBoop> {
    SubmitRequest::new(
        track.account,
        track.nonce_track,
        nonce,
        TestBoop {
            hash: tx_hash(nonce + 1),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_included_request_returns_receipt() {
    let harness = setup().await;

    let outcome = harness.queue.enqueue(boop(track(1), 0)).await.unwrap();
    match outcome {
        ExecutionOutcome::Included {
            receipt,
            transaction_hash,
            ..
        } => {
            assert_eq!(receipt.transaction_hash, transaction_hash);
            assert_eq!(receipt.block_number, 100);
        }
        other => panic!("expected inclusion, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_track_requests_use_one_executor_in_order() {
    let harness = setup().await;

    let outcomes = futures::future::join_all([2, 0, 1].map(|nonce| harness.queue.enqueue(boop(track(1), nonce)))).await;
    assert!(outcomes.iter().all(|outcome| matches!(outcome, Ok(ExecutionOutcome::Included { .. }))));

    let sent = harness.path.sent.lock().unwrap().clone();
    assert_eq!(sent.iter().map(|(_, nonce)| *nonce).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(sent.iter().all(|(executor, _)| *executor == sent[0].0));

    let assignment = harness.queue.processor().assignment();
    assert_eq!(assignment.assigned(account(1), Default::default()), Some(sent[0].0));
}

#[tokio::test(start_paused = true)]
async fn test_execution_failure_does_not_consume_nonce() {
    let harness = setup().await;
    harness.path.rejected.lock().unwrap().insert(0);

    let outcome = harness.queue.enqueue(boop(track(1), 0)).await.unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed {
            error: SubmitterError::ValidationError { .. }
        }
    ));
    assert_eq!(harness.nonces.fetches(), 2);

    // The same nonce can be submitted again
    let retry = harness.queue.enqueue(boop(track(1), 0)).await.unwrap();
    assert!(matches!(retry, ExecutionOutcome::Included { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_missing_receipt_times_out_but_consumes_nonce() {
    let harness = setup().await;
    harness.path.silent.lock().unwrap().insert(0);

    let outcome = harness.queue.enqueue(boop(track(1), 0)).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    assert!(outcome.transaction_hash().is_some());

    // No resync: the next nonce is accepted straight away
    let next = harness.queue.enqueue(boop(track(1), 1)).await.unwrap();
    assert!(matches!(next, ExecutionOutcome::Included { .. }));
    assert_eq!(harness.nonces.fetches(), 1);
}
