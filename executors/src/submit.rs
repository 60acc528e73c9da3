use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::{Address, B256};
use submitter_core::{constants::DEFAULT_RECEIPT_TIMEOUT, error::SubmitterError};

use crate::{
    executor::ExecutorAssignment,
    nonce_queue::{RequestProcessor, SubmitRequest},
    receipt::{ReceiptResolver, ReceiptResult, ReceiptSource},
};

/// Payloads that carry the hash identifying the request, used to pin the
/// request to an executor.
pub trait RequestHash {
    fn request_hash(&self) -> B256;
}

/// Signs and sends a request on chain with the given executor.
pub trait ExecutionPath: Send + Sync + 'static {
    type Payload: RequestHash + Send + Sync + 'static;

    /// Returns the hash of the transaction that was sent.
    fn execute(
        &self,
        executor: Address,
        request: &SubmitRequest<Self::Payload>,
    ) -> impl Future<Output = Result<B256, SubmitterError>> + Send;
}

/// How a processed request ended.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome<R> {
    Included {
        receipt: R,
        executor: Address,
        transaction_hash: B256,
    },
    /// Seen in a block, but the receipt could not be read.
    IncludedNoReceipt {
        executor: Address,
        transaction_hash: B256,
    },
    /// Sent, but neither included nor found before the receipt timeout.
    TimedOut {
        executor: Address,
        transaction_hash: B256,
    },
    /// Never reached the chain.
    Failed { error: SubmitterError },
}

impl<R> ExecutionOutcome<R> {
    pub fn transaction_hash(&self) -> Option<B256> {
        match self {
            ExecutionOutcome::Included {
                transaction_hash, ..
            }
            | ExecutionOutcome::IncludedNoReceipt {
                transaction_hash, ..
            }
            | ExecutionOutcome::TimedOut {
                transaction_hash, ..
            } => Some(*transaction_hash),
            ExecutionOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed { .. })
    }
}

/// Processes queued requests: picks the executor, sends through the
/// [`ExecutionPath`] and waits for the receipt.
pub struct SubmitPipeline<E, S: ReceiptSource> {
    assignment: ExecutorAssignment,
    path: E,
    receipts: Arc<ReceiptResolver<S>>,
    receipt_timeout: Duration,
}

impl<E: ExecutionPath, S: ReceiptSource> SubmitPipeline<E, S> {
    pub fn new(
        assignment: ExecutorAssignment,
        path: E,
        receipts: Arc<ReceiptResolver<S>>,
    ) -> Self {
        Self {
            assignment,
            path,
            receipts,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }

    pub fn with_receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub fn assignment(&self) -> &ExecutorAssignment {
        &self.assignment
    }

    pub fn receipts(&self) -> &ReceiptResolver<S> {
        &self.receipts
    }
}

impl<E: ExecutionPath, S: ReceiptSource> RequestProcessor for SubmitPipeline<E, S> {
    type Payload = E::Payload;
    type Output = ExecutionOutcome<S::Receipt>;

    #[tracing::instrument(
        name = "submit_request",
        skip_all,
        fields(
            account = %request.account,
            nonce_track = %request.nonce_track,
            nonce = request.nonce_value,
            request_hash = %request.payload.request_hash(),
        )
    )]
    async fn process(&self, request: &SubmitRequest<E::Payload>) -> ExecutionOutcome<S::Receipt> {
        let request_hash = request.payload.request_hash();

        let executor = match self
            .assignment
            .get(request_hash, request.account, request.nonce_track)
        {
            Ok(executor) => executor,
            Err(e) => {
                tracing::error!(error = %e, "No executor for request");
                return ExecutionOutcome::Failed {
                    error: SubmitterError::InternalError {
                        message: e.to_string(),
                    },
                };
            }
        };

        let transaction_hash = match self.path.execute(executor, request).await {
            Ok(hash) => hash,
            Err(error) => {
                tracing::warn!(executor = %executor, error = %error, "Execution failed");
                return ExecutionOutcome::Failed { error };
            }
        };
        tracing::debug!(executor = %executor, transaction_hash = %transaction_hash, "Transaction sent");

        match self
            .receipts
            .wait_for_receipt(transaction_hash, self.receipt_timeout)
            .await
        {
            ReceiptResult::Receipt(receipt) => ExecutionOutcome::Included {
                receipt,
                executor,
                transaction_hash,
            },
            ReceiptResult::CantFetch => ExecutionOutcome::IncludedNoReceipt {
                executor,
                transaction_hash,
            },
            ReceiptResult::TimedOut => {
                tracing::warn!(executor = %executor, transaction_hash = %transaction_hash, "Timed out waiting for receipt");
                ExecutionOutcome::TimedOut {
                    executor,
                    transaction_hash,
                }
            }
        }
    }

    fn nonce_consumed(output: &Self::Output) -> bool {
        !output.is_failed()
    }
}
