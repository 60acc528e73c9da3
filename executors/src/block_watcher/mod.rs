pub mod connector;
pub mod transport;

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use submitter_core::{
    BlockHeader,
    constants::{DEFAULT_RESTART_BACKOFF, DEFAULT_WATCHDOG_TIMEOUT},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

pub use connector::{AlloyConnector, AlloyPoller, BlockPoller, BlockStream, EndpointConnector};
pub use transport::{ChainTransport, StreamEvent, TransportConfig, TransportError, TransportKind};

use crate::{
    metrics,
    shutdown::{ShutdownError, WorkerHandle},
};

pub type BlockCallback = Arc<dyn Fn(&BlockHeader) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatcherError {
    #[error("No block received within {waited_ms}ms")]
    #[serde(rename_all = "camelCase")]
    NoBlockYet { waited_ms: u64 },

    #[error("Block watcher is stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct BlockWatcherConfig {
    /// Restart the stream when no new block arrived for this long.
    pub watchdog_timeout: Duration,
    /// Pause between tearing a stream down and starting the next one.
    pub restart_backoff: Duration,
}

impl Default for BlockWatcherConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

#[derive(Debug)]
enum RestartReason {
    StartFailed(TransportError),
    StreamError(TransportError),
    StreamClosed,
    Watchdog,
}

impl RestartReason {
    fn label(&self) -> &'static str {
        match self {
            RestartReason::StartFailed(_) => "start_failed",
            RestartReason::StreamError(_) => "stream_error",
            RestartReason::StreamClosed => "stream_closed",
            RestartReason::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::StartFailed(e) => write!(f, "failed to start: {e}"),
            RestartReason::StreamError(e) => write!(f, "stream error: {e}"),
            RestartReason::StreamClosed => f.write_str("stream closed"),
            RestartReason::Watchdog => f.write_str("no new block before watchdog timeout"),
        }
    }
}

struct WatcherShared {
    subscribers: RwLock<HashMap<u64, BlockCallback>>,
    next_subscriber: AtomicU64,
    current: watch::Sender<Option<BlockHeader>>,
    previous: Mutex<Option<BlockHeader>>,
    stopped: AtomicBool,
}

impl WatcherShared {
    /// Records the block and fans it out. Returns `false` if it was skipped.
    fn handle_block(&self, block: BlockHeader) -> bool {
        let current = self.current.borrow().clone();

        if let Some(current) = &current {
            if current.hash == block.hash {
                tracing::debug!(block_number = block.number, "Duplicate block, skipping");
                return false;
            }

            if block.number > current.number + 1 {
                tracing::warn!(
                    from = current.number,
                    to = block.number,
                    "Block gap detected, missing blocks are not backfilled"
                );
            } else if block.number <= current.number {
                let previous = self
                    .previous
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if previous.is_some_and(|previous| previous.hash == block.hash) {
                    tracing::warn!(
                        current = current.number,
                        block_number = block.number,
                        "Out of order block delivery, skipping"
                    );
                    return false;
                }
                tracing::warn!(
                    current = current.number,
                    current_hash = %current.hash,
                    block_number = block.number,
                    block_hash = %block.hash,
                    "Possible re-org, accepting block"
                );
            }
        }

        *self
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = current;
        self.current.send_replace(Some(block.clone()));
        metrics::set_current_block(block.number);
        tracing::trace!(block_number = block.number, block_hash = %block.hash, "New block");

        // Subscribers may come and go from inside a callback
        let callbacks: Vec<BlockCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&block))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                tracing::error!(
                    block_number = block.number,
                    block_hash = %block.hash,
                    error = %message,
                    "Block subscriber panicked"
                );
            }
        }

        true
    }
}

/// Handle returned by [`BlockWatcher::on_block`]. Dropping it keeps the
/// subscription alive; call [`BlockSubscription::unsubscribe`] to end it.
#[derive(Debug)]
pub struct BlockSubscription {
    id: u64,
    shared: Weak<WatcherShared>,
}

impl BlockSubscription {
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id)
            .is_some()
    }
}

impl fmt::Debug for WatcherShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherShared")
            .field("current", &*self.current.borrow())
            .finish_non_exhaustive()
    }
}

/// Keeps a live view of the chain head and fans new blocks out to subscribers.
///
/// Owns one [`ChainTransport`] for its whole life and restarts the stream
/// whenever it fails or goes quiet for longer than the watchdog timeout.
pub struct BlockWatcher {
    shared: Arc<WatcherShared>,
    supervisor: Mutex<Option<WorkerHandle>>,
}

impl BlockWatcher {
    /// Spawns the supervision loop. Must be called from within a tokio runtime.
    pub fn start<C: EndpointConnector>(
        transport: ChainTransport<C>,
        config: BlockWatcherConfig,
    ) -> Arc<Self> {
        let (current, _) = watch::channel(None);
        let shared = Arc::new(WatcherShared {
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            current,
            previous: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(supervise(shared.clone(), transport, config, shutdown_rx));

        Arc::new(Self {
            shared,
            supervisor: Mutex::new(Some(WorkerHandle::new(
                "block_watcher",
                join_handle,
                shutdown_tx,
            ))),
        })
    }

    /// Registers a callback invoked with every new block.
    pub fn on_block(
        &self,
        callback: impl Fn(&BlockHeader) + Send + Sync + 'static,
    ) -> BlockSubscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::new(callback));

        BlockSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// The latest block, if one has been seen.
    pub fn latest_block(&self) -> Option<BlockHeader> {
        self.shared.current.borrow().clone()
    }

    /// The block seen before the latest one.
    pub fn previous_block(&self) -> Option<BlockHeader> {
        self.shared
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits up to `wait` for the first block, then returns the latest one.
    pub async fn current_block(&self, wait: Duration) -> Result<BlockHeader, WatcherError> {
        if let Some(block) = self.latest_block() {
            return Ok(block);
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(WatcherError::Stopped);
        }

        let mut receiver = self.shared.current.subscribe();
        match tokio::time::timeout(wait, receiver.wait_for(Option::is_some)).await {
            Ok(Ok(block)) => block.clone().ok_or(WatcherError::Stopped),
            Ok(Err(_)) => Err(WatcherError::Stopped),
            Err(_) => Err(WatcherError::NoBlockYet {
                waited_ms: wait.as_millis() as u64,
            }),
        }
    }

    /// A receiver that observes every change of the latest block.
    pub fn watch_blocks(&self) -> watch::Receiver<Option<BlockHeader>> {
        self.shared.current.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops the block stream and drops every subscriber.
    pub async fn stop_service(&self) -> Result<(), ShutdownError> {
        self.shared.stopped.store(true, Ordering::Release);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();

        match supervisor {
            Some(supervisor) => supervisor.shutdown().await,
            None => Ok(()),
        }
    }
}

#[tracing::instrument(name = "block_watcher", skip_all)]
async fn supervise<C: EndpointConnector>(
    shared: Arc<WatcherShared>,
    mut transport: ChainTransport<C>,
    config: BlockWatcherConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let outcome = tokio::select! {
            _ = &mut shutdown_rx => None,
            reason = run_stream(&shared, &mut transport, &config, events_tx, &mut events_rx) => Some(reason),
        };

        transport.stop_block_stream();

        let Some(reason) = outcome else {
            tracing::info!("Block watcher shutting down");
            return;
        };

        tracing::warn!(
            reason = %reason,
            backoff_ms = config.restart_backoff.as_millis() as u64,
            "Restarting block stream"
        );
        metrics::record_watcher_restart(reason.label());

        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::info!("Block watcher shutting down");
                return;
            }
            _ = tokio::time::sleep(config.restart_backoff) => {}
        }
    }
}

async fn run_stream<C: EndpointConnector>(
    shared: &WatcherShared,
    transport: &mut ChainTransport<C>,
    config: &BlockWatcherConfig,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
) -> RestartReason {
    match transport.start_block_stream(events_tx).await {
        Ok((url, kind)) => tracing::info!(url = %url, kind = %kind, "Block stream started"),
        Err(e) => return RestartReason::StartFailed(e),
    }

    let watchdog = tokio::time::sleep(config.watchdog_timeout);
    tokio::pin!(watchdog);

    loop {
        tokio::select! {
            _ = &mut watchdog => return RestartReason::Watchdog,
            event = events_rx.recv() => match event {
                None | Some(StreamEvent::Stopped { .. }) => return RestartReason::StreamClosed,
                Some(StreamEvent::Block(block)) => {
                    if shared.handle_block(block) {
                        watchdog.as_mut().reset(Instant::now() + config.watchdog_timeout);
                    }
                }
                Some(StreamEvent::Error(e)) => return RestartReason::StreamError(e),
            },
        }
    }
}
