use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::B256,
    providers::{Provider, RootProvider},
    rpc::types::TransactionReceipt,
};
use submitter_core::{
    BlockHeader,
    chain::{Chain, SubmitterChain},
    constants::{
        DEFAULT_RECEIPT_LAST_DITCH_TIMEOUT, DEFAULT_RECEIPT_RETRIES, DEFAULT_RECEIPT_RETRY_DELAY,
    },
    error::{AlloyRpcErrorToSubmitterError, SubmitterError},
};
use tokio::{sync::oneshot, time::Instant};

use crate::{
    block_watcher::{BlockSubscription, BlockWatcher},
    metrics,
};

/// Reads transaction receipts.
pub trait ReceiptSource: Send + Sync + 'static {
    type Receipt: Clone + Send + Sync + 'static;

    fn fetch_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Self::Receipt>, SubmitterError>> + Send;
}

impl ReceiptSource for SubmitterChain {
    type Receipt = TransactionReceipt;

    async fn fetch_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, SubmitterError> {
        self.provider()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| e.to_submitter_error(self))
    }
}

impl ReceiptSource for RootProvider {
    type Receipt = TransactionReceipt;

    async fn fetch_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, SubmitterError> {
        self.get_transaction_receipt(hash)
            .await
            .map_err(|e| SubmitterError::InternalError {
                message: format!("failed to fetch receipt for {hash}: {e}"),
            })
    }
}

/// Terminal outcome of waiting for a receipt. All three are valid results.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptResult<R> {
    Receipt(R),
    /// The transaction was seen in a block but its receipt could not be read.
    CantFetch,
    TimedOut,
}

impl<R> ReceiptResult<R> {
    fn label(&self) -> &'static str {
        match self {
            ReceiptResult::Receipt(_) => "receipt",
            ReceiptResult::CantFetch => "cant_fetch",
            ReceiptResult::TimedOut => "timed_out",
        }
    }

    pub fn receipt(&self) -> Option<&R> {
        match self {
            ReceiptResult::Receipt(receipt) => Some(receipt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiptResolverConfig {
    /// Fetch attempts after the transaction shows up in a block.
    pub retries: u32,
    /// Attempt `n` waits `retry_delay * n` before the next one.
    pub retry_delay: Duration,
    /// Bound on the fetch made once a waiter's own timeout has passed.
    pub last_ditch_timeout: Duration,
}

impl Default for ReceiptResolverConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RECEIPT_RETRIES,
            retry_delay: DEFAULT_RECEIPT_RETRY_DELAY,
            last_ditch_timeout: DEFAULT_RECEIPT_LAST_DITCH_TIMEOUT,
        }
    }
}

type Waiters<R> = HashMap<B256, HashMap<u64, oneshot::Sender<ReceiptResult<R>>>>;

struct ResolverInner<S: ReceiptSource> {
    source: S,
    config: ReceiptResolverConfig,
    waiters: Mutex<Waiters<S::Receipt>>,
    next_waiter: AtomicU64,
}

/// Resolves transaction hashes to receipts by watching the block stream.
///
/// Every waiter resolves exactly once: with the receipt, with
/// [`ReceiptResult::CantFetch`] when the transaction was included but its
/// receipt stayed unavailable, or with [`ReceiptResult::TimedOut`].
pub struct ReceiptResolver<S: ReceiptSource> {
    inner: Arc<ResolverInner<S>>,
    subscription: Mutex<Option<BlockSubscription>>,
}

impl<S: ReceiptSource> ReceiptResolver<S> {
    pub fn new(source: S, watcher: &BlockWatcher, config: ReceiptResolverConfig) -> Self {
        let inner = Arc::new(ResolverInner {
            source,
            config,
            waiters: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        });

        let weak: Weak<ResolverInner<S>> = Arc::downgrade(&inner);
        let subscription = watcher.on_block(move |block| {
            if let Some(inner) = weak.upgrade() {
                inner.on_block(block);
            }
        });

        Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Waits for the receipt of `hash` for at most `timeout`.
    #[tracing::instrument(name = "wait_for_receipt", skip_all, fields(hash = %hash))]
    pub async fn wait_for_receipt(&self, hash: B256, timeout: Duration) -> ReceiptResult<S::Receipt> {
        let result = self.inner.wait(hash, timeout).await;
        metrics::record_receipt_outcome(result.label());
        result
    }

    /// Number of hashes with at least one waiter.
    pub fn pending_hashes(&self) -> usize {
        self.inner.lock().len()
    }

    /// Stops listening to blocks. Outstanding waiters still resolve through
    /// their direct fetches and timeouts.
    pub fn stop(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl<S: ReceiptSource> ResolverInner<S> {
    fn lock(&self) -> MutexGuard<'_, Waiters<S::Receipt>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait(self: &Arc<Self>, hash: B256, timeout: Duration) -> ReceiptResult<S::Receipt> {
        let deadline = Instant::now() + timeout;
        let (sender, mut receiver) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut waiters = self.lock();
            let entry = waiters.entry(hash).or_default();
            entry.insert(id, sender);
            entry.len() == 1
        };
        let _registration = Registration {
            inner: self.as_ref(),
            hash,
            id,
        };

        // Other waiters on the same hash mean it is already being watched
        if first {
            tokio::select! {
                result = &mut receiver => return result.unwrap_or(ReceiptResult::TimedOut),
                fetched = self.fetch(hash) => {
                    if let Some(receipt) = fetched {
                        self.resolve_all(hash, ReceiptResult::Receipt(receipt));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => return ReceiptResult::TimedOut,
            Err(_) => {}
        }

        // Covers a missed block notification, or a receipt that was not yet
        // served when the transaction was first seen.
        let last_ditch =
            tokio::time::timeout(self.config.last_ditch_timeout, self.fetch(hash)).await;
        match last_ditch {
            Ok(Some(receipt)) => {
                tracing::info!("Retrieved receipt in last ditch attempt");
                self.resolve_all(hash, ReceiptResult::Receipt(receipt));
            }
            Ok(None) => self.resolve_one(hash, id, ReceiptResult::TimedOut),
            Err(_) => {
                tracing::debug!(hash = %hash, "Last ditch receipt fetch timed out");
                self.resolve_one(hash, id, ReceiptResult::TimedOut);
            }
        }

        receiver.await.unwrap_or(ReceiptResult::TimedOut)
    }

    fn on_block(self: &Arc<Self>, block: &BlockHeader) {
        let included: Vec<B256> = {
            let waiters = self.lock();
            if waiters.is_empty() {
                return;
            }
            block
                .transaction_hashes
                .iter()
                .filter(|hash| waiters.contains_key(*hash))
                .copied()
                .collect()
        };

        for hash in included {
            tracing::debug!(hash = %hash, block_number = block.number, "Watched transaction included");
            let inner = self.clone();
            tokio::spawn(async move { inner.resolve_included(hash).await });
        }
    }

    async fn resolve_included(&self, hash: B256) {
        for attempt in 1..=self.config.retries {
            if let Some(receipt) = self.fetch(hash).await {
                self.resolve_all(hash, ReceiptResult::Receipt(receipt));
                return;
            }
            if attempt < self.config.retries {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        tracing::warn!(hash = %hash, retries = self.config.retries, "Transaction included but receipt unavailable");
        self.resolve_all(hash, ReceiptResult::CantFetch);
    }

    async fn fetch(&self, hash: B256) -> Option<S::Receipt> {
        match self.source.fetch_receipt(hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::debug!(hash = %hash, error = %e, "Receipt fetch failed");
                None
            }
        }
    }

    fn resolve_all(&self, hash: B256, result: ReceiptResult<S::Receipt>) {
        let Some(waiters) = self.lock().remove(&hash) else {
            return;
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_one(&self, hash: B256, id: u64, result: ReceiptResult<S::Receipt>) {
        if let Some(waiter) = self.remove_waiter(hash, id) {
            let _ = waiter.send(result);
        }
    }

    fn remove_waiter(
        &self,
        hash: B256,
        id: u64,
    ) -> Option<oneshot::Sender<ReceiptResult<S::Receipt>>> {
        let mut waiters = self.lock();
        let entry = waiters.get_mut(&hash)?;
        let waiter = entry.remove(&id);
        if entry.is_empty() {
            waiters.remove(&hash);
        }
        waiter
    }
}

/// Deregisters a waiter whose future is dropped before it resolved.
struct Registration<'a, S: ReceiptSource> {
    inner: &'a ResolverInner<S>,
    hash: B256,
    id: u64,
}

impl<S: ReceiptSource> Drop for Registration<'_, S> {
    fn drop(&mut self) {
        self.inner.remove_waiter(self.hash, self.id);
    }
}
