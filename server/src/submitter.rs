use std::sync::Arc;

use alloy::{
    primitives::{Address, aliases::U192},
    rpc::types::TransactionReceipt,
};
use submitter_core::{
    chain::{Chain, SubmitterChain},
    error::SubmitterError,
};
use submitter_executors::{
    block_watcher::{AlloyConnector, BlockWatcher, ChainTransport, WatcherError},
    executor::{AssignmentError, ExecutorAssignment},
    nonce_queue::{NonceQueue, PendingEntry, QueueError, SubmitRequest},
    receipt::ReceiptResolver,
    shutdown::ShutdownError,
    submit::{ExecutionOutcome, SubmitPipeline},
};
use thiserror::Error;

use crate::{
    config::SubmitterConfig,
    execution::{EncodedBoop, EntryPointExecutor, EntryPointNonceSource},
};

pub type BoopPipeline = SubmitPipeline<EntryPointExecutor, SubmitterChain>;
pub type BoopQueue = NonceQueue<EntryPointNonceSource, BoopPipeline>;
pub type BoopOutcome = ExecutionOutcome<TransactionReceipt>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Chain(#[from] SubmitterError),

    #[error(transparent)]
    Executors(#[from] AssignmentError),

    #[error("Chain is not producing blocks: {0}")]
    NoBlocks(#[from] WatcherError),
}

/// The running submission subsystem for one chain.
pub struct Submitter {
    queue: BoopQueue,
    receipts: Arc<ReceiptResolver<SubmitterChain>>,
    watcher: Arc<BlockWatcher>,
}

impl Submitter {
    /// Connects to the chain and waits for the first block before accepting work.
    #[tracing::instrument(name = "submitter_start", skip_all, fields(chain_id = config.chain.chain_id))]
    pub async fn start(config: &SubmitterConfig) -> Result<Self, StartupError> {
        let chain = config.chain.to_chain_config().to_chain()?;
        let entry_point = config.chain.entry_point;

        let transport = ChainTransport::new(
            AlloyConnector,
            chain.endpoints().clone(),
            config.monitoring.transport(),
        );
        let watcher = BlockWatcher::start(transport, config.monitoring.watcher());

        let block = match watcher
            .current_block(config.monitoring.initial_block_wait())
            .await
        {
            Ok(block) => block,
            Err(e) => {
                if let Err(stop_error) = watcher.stop_service().await {
                    tracing::error!(error = %stop_error, "Failed to stop block watcher");
                }
                return Err(e.into());
            }
        };
        tracing::info!(block_number = block.number, "Block watcher is live");

        let receipts = Arc::new(ReceiptResolver::new(
            chain.clone(),
            &watcher,
            config.receipts.resolver(),
        ));

        let executor =
            EntryPointExecutor::new(chain.clone(), entry_point, &config.executors.private_keys)?;
        let assignment =
            ExecutorAssignment::new(executor.executors(), config.executors.assignment_ttl())?;
        let pipeline = SubmitPipeline::new(assignment, executor, receipts.clone())
            .with_receipt_timeout(config.receipts.timeout());

        let queue = NonceQueue::new(
            EntryPointNonceSource {
                chain: chain.clone(),
                entry_point,
            },
            pipeline,
            (&config.queue).into(),
        );

        tracing::info!(
            chain_id = chain.chain_id(),
            entry_point = %entry_point,
            "Submitter started"
        );

        Ok(Self {
            queue,
            receipts,
            watcher,
        })
    }

    /// Queues a boop and resolves once it settled on chain or was refused.
    pub async fn submit(
        &self,
        account: Address,
        nonce_track: U192,
        nonce_value: u64,
        boop: EncodedBoop,
    ) -> Result<BoopOutcome, QueueError> {
        self.queue
            .enqueue(SubmitRequest::new(account, nonce_track, nonce_value, boop))
            .await
    }

    pub fn pending_for(&self, account: Address) -> Vec<PendingEntry> {
        self.queue.pending_for(account)
    }

    pub fn watcher(&self) -> &Arc<BlockWatcher> {
        &self.watcher
    }

    /// Refuses all queued work, then stops receipt tracking and the block stream.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.queue.shutdown();
        self.receipts.stop();
        self.watcher.stop_service().await
    }
}
