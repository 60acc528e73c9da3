pub mod error;
mod track;

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use alloy::primitives::{Address, aliases::U192};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde::Serialize;
use submitter_core::{
    TrackKey,
    constants::{
        DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_PENDING_PER_TRACK, DEFAULT_MAX_PENDING_TIME,
        DEFAULT_MAX_TOTAL_PENDING,
    },
    error::SubmitterError,
};
use tokio::{
    sync::{Semaphore, oneshot},
    task::AbortHandle,
    time::Instant,
};

pub use error::QueueError;
pub use track::SubmitRequest;

use crate::metrics;
use track::{QueuedRequest, Track};

/// Reads the next expected nonce for a track from the chain.
pub trait NonceSource: Send + Sync + 'static {
    fn fetch_nonce(
        &self,
        track: TrackKey,
    ) -> impl Future<Output = Result<u64, SubmitterError>> + Send;
}

/// Executes a request once it is at the head of its track.
pub trait RequestProcessor: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Output: Send + 'static;

    fn process(
        &self,
        request: &SubmitRequest<Self::Payload>,
    ) -> impl Future<Output = Self::Output> + Send;

    /// Whether the request's nonce was used up on chain. When it was not, the
    /// track re-reads its nonce before the next request runs.
    fn nonce_consumed(output: &Self::Output) -> bool;
}

#[derive(Debug, Clone)]
pub struct NonceQueueConfig {
    /// Per-track capacity, executing request included. Also bounds how far
    /// ahead of the expected nonce a request may be.
    pub max_pending_per_track: usize,
    /// Capacity across all tracks.
    pub max_total_pending: usize,
    /// Requests executing at the same time across all tracks.
    pub max_in_flight: usize,
    /// How long a request may wait before it starts executing.
    pub max_pending_time: Duration,
}

impl Default for NonceQueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_track: DEFAULT_MAX_PENDING_PER_TRACK,
            max_total_pending: DEFAULT_MAX_TOTAL_PENDING,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_pending_time: DEFAULT_MAX_PENDING_TIME,
        }
    }
}

/// A request held by the queue, as reported by [`NonceQueue::pending_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub nonce_track: U192,
    pub nonce_value: u64,
    pub executing: bool,
}

type Output<P> = <P as RequestProcessor>::Output;
type Payload<P> = <P as RequestProcessor>::Payload;
type Entry<P> = QueuedRequest<Payload<P>, Output<P>>;
type NonceFetch = Shared<BoxFuture<'static, Result<u64, QueueError>>>;

struct QueueState<P: RequestProcessor> {
    tracks: HashMap<TrackKey, Track<Payload<P>, Output<P>>>,
    nonce_fetches: HashMap<TrackKey, NonceFetch>,
    total: usize,
    next_id: u64,
    next_track_seq: u64,
    closed: bool,
}

impl<P: RequestProcessor> QueueState<P> {
    fn new() -> Self {
        Self {
            tracks: HashMap::new(),
            nonce_fetches: HashMap::new(),
            total: 0,
            next_id: 0,
            next_track_seq: 0,
            closed: false,
        }
    }

    /// Rejects every waiting request of the track with the most of them.
    /// Ties go to the oldest track. Returns how many were rejected.
    fn prune_most_active(&mut self, keep: &TrackKey) -> usize {
        let Some(key) = self
            .tracks
            .iter()
            .filter(|(_, track)| !track.buffer.is_empty())
            .max_by(|(_, a), (_, b)| {
                a.len()
                    .cmp(&b.len())
                    .then_with(|| b.created_seq.cmp(&a.created_seq))
            })
            .map(|(key, _)| *key)
        else {
            return 0;
        };

        let Some(track) = self.tracks.get_mut(&key) else {
            return 0;
        };
        let pruned = std::mem::take(&mut track.buffer);
        let remove = track.is_idle() && key != *keep;
        if remove {
            self.tracks.remove(&key);
        }

        let count = pruned.len();
        self.total -= count;
        tracing::warn!(track = %key, pruned = count, "Pruned most active track at capacity");
        for entry in pruned.into_values() {
            entry.reject(QueueError::Pruned);
        }
        count
    }
}

enum Admission<P: RequestProcessor> {
    Queued(oneshot::Receiver<Result<Output<P>, QueueError>>),
    TrackGone(SubmitRequest<Payload<P>>),
}

enum Execution {
    Executed { consumed: bool },
    NotExecuted,
}

struct QueueInner<S, P: RequestProcessor> {
    source: S,
    processor: P,
    config: NonceQueueConfig,
    permits: Arc<Semaphore>,
    state: Mutex<QueueState<P>>,
}

/// Per-track nonce-ordered admission and draining of requests.
///
/// Requests on the same `(account, nonceTrack)` run strictly one at a time in
/// nonce order, starting from the on-chain nonce. Different tracks run in
/// parallel up to `max_in_flight`.
pub struct NonceQueue<S, P: RequestProcessor> {
    inner: Arc<QueueInner<S, P>>,
}

impl<S, P: RequestProcessor> Clone for NonceQueue<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NonceSource, P: RequestProcessor> NonceQueue<S, P> {
    pub fn new(source: S, processor: P, config: NonceQueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                source,
                processor,
                permits: Arc::new(Semaphore::new(config.max_in_flight)),
                config,
                state: Mutex::new(QueueState::new()),
            }),
        }
    }

    pub fn config(&self) -> &NonceQueueConfig {
        &self.inner.config
    }

    pub fn processor(&self) -> &P {
        &self.inner.processor
    }

    /// Queues the request and resolves once it has been processed or rejected.
    pub async fn enqueue(
        &self,
        mut request: SubmitRequest<Payload<P>>,
    ) -> Result<Output<P>, QueueError> {
        let key = request.track_key();

        let receiver = loop {
            if let Err(e) = self.inner.ensure_track(key).await {
                metrics::record_queue_rejection(e.reason());
                return Err(e);
            }

            match self.inner.admit(request) {
                Ok(Admission::Queued(receiver)) => break receiver,
                Ok(Admission::TrackGone(returned)) => request = returned,
                Err(e) => {
                    metrics::record_queue_rejection(e.reason());
                    return Err(e);
                }
            }
        };

        receiver.await.unwrap_or(Err(QueueError::Shutdown))
    }

    /// Requests held for `account`, executing ones included.
    pub fn pending_for(&self, account: Address) -> Vec<PendingEntry> {
        let state = self.inner.lock();
        let mut entries: Vec<PendingEntry> = state
            .tracks
            .iter()
            .filter(|(key, _)| key.account == account)
            .flat_map(|(key, track)| {
                let executing = track.active.map(|nonce| PendingEntry {
                    nonce_track: key.nonce_track,
                    nonce_value: nonce,
                    executing: true,
                });
                let buffered = track.buffer.keys().map(|nonce| PendingEntry {
                    nonce_track: key.nonce_track,
                    nonce_value: *nonce,
                    executing: false,
                });
                executing.into_iter().chain(buffered)
            })
            .collect();

        entries.sort_by_key(|entry| (entry.nonce_track, entry.nonce_value));
        entries
    }

    /// Requests currently held, executing ones included.
    pub fn buffered(&self) -> usize {
        self.inner.lock().total
    }

    /// Rejects everything still waiting and refuses new requests. Executing
    /// requests run to completion.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.closed = true;

        let mut rejected = Vec::new();
        state.tracks.retain(|_, track| {
            rejected.extend(std::mem::take(&mut track.buffer).into_values());
            !track.is_idle()
        });
        state.total -= rejected.len();
        metrics::set_buffered_requests(state.total);
        drop(guard);

        tracing::info!(rejected = rejected.len(), "Nonce queue shut down");
        for entry in rejected {
            entry.reject(QueueError::Shutdown);
        }
    }
}

impl<S: NonceSource, P: RequestProcessor> QueueInner<S, P> {
    fn lock(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes sure the track exists, reading its nonce from chain if needed.
    /// Concurrent callers for the same track share one read.
    async fn ensure_track(self: &Arc<Self>, key: TrackKey) -> Result<(), QueueError> {
        let fetch = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Shutdown);
            }
            if state.tracks.contains_key(&key) {
                return Ok(());
            }

            state
                .nonce_fetches
                .entry(key)
                .or_insert_with(|| {
                    let inner = self.clone();
                    async move {
                        inner.source.fetch_nonce(key).await.map_err(|e| {
                            QueueError::NonceFetch {
                                message: e.to_string(),
                            }
                        })
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let result = fetch.clone().await;

        let mut guard = self.lock();
        let state = &mut *guard;
        if state
            .nonce_fetches
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&fetch))
        {
            state.nonce_fetches.remove(&key);
        }

        let nonce = result.inspect_err(|e| {
            tracing::warn!(track = %key, error = %e, "Failed to initialise nonce track");
        })?;

        if !state.tracks.contains_key(&key) {
            state.next_track_seq += 1;
            tracing::debug!(track = %key, next_nonce = nonce, "Initialised nonce track");
            state
                .tracks
                .insert(key, Track::new(nonce, state.next_track_seq));
        }
        Ok(())
    }

    fn admit(
        self: &Arc<Self>,
        request: SubmitRequest<Payload<P>>,
    ) -> Result<Admission<P>, QueueError> {
        let key = request.track_key();
        let nonce = request.nonce_value;

        let mut guard = self.lock();
        let state = &mut *guard;

        if state.closed {
            return Err(QueueError::Shutdown);
        }
        if !state.tracks.contains_key(&key) {
            return Ok(Admission::TrackGone(request));
        }

        self.check_admission(state, &key, nonce)?;

        state.next_id += 1;
        let id = state.next_id;

        let Some(track) = state.tracks.get_mut(&key) else {
            return Ok(Admission::TrackGone(request));
        };

        let enqueued_at = Instant::now();
        let (responder, receiver) = oneshot::channel();
        let entry = QueuedRequest {
            id,
            request,
            responder,
            enqueued_at,
            expiry: Some(self.spawn_expiry(key, nonce, id, enqueued_at)),
        };

        let replaced = track.buffer.insert(nonce, entry);
        let head = track.claim_next();
        if replaced.is_none() {
            state.total += 1;
        }
        metrics::set_buffered_requests(state.total);
        drop(guard);

        if let Some(replaced) = replaced {
            replaced.reject(QueueError::Replaced);
        }

        if let Some(head) = head {
            tokio::spawn(self.clone().drain(key, head));
        }

        Ok(Admission::Queued(receiver))
    }

    fn check_admission(
        &self,
        state: &mut QueueState<P>,
        key: &TrackKey,
        nonce: u64,
    ) -> Result<(), QueueError> {
        if state.total >= self.config.max_total_pending && state.prune_most_active(key) == 0 {
            return Err(QueueError::OverCapacity);
        }

        let window = self.config.max_pending_per_track;
        let Some(track) = state.tracks.get(key) else {
            return Ok(());
        };

        if track.len() >= window {
            return Err(QueueError::BufferExceeded);
        }

        // u64::MAX has no successor, so it can never be consumed
        if nonce < track.next_nonce
            || nonce - track.next_nonce > window as u64
            || nonce == u64::MAX
        {
            return Err(QueueError::NonceOutOfRange {
                nonce,
                next_nonce: track.next_nonce,
                window: window as u64,
            });
        }

        if track.active == Some(nonce) {
            return Err(QueueError::NonceInFlight { nonce });
        }

        Ok(())
    }

    fn spawn_expiry(
        self: &Arc<Self>,
        key: TrackKey,
        nonce: u64,
        id: u64,
        enqueued_at: Instant,
    ) -> AbortHandle {
        let inner: Weak<Self> = Arc::downgrade(self);
        let deadline = enqueued_at + self.config.max_pending_time;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(key, nonce, id);
            }
        })
        .abort_handle()
    }

    fn expire(&self, key: TrackKey, nonce: u64, id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(track) = state.tracks.get_mut(&key) else {
            return;
        };
        if track.buffer.get(&nonce).is_none_or(|entry| entry.id != id) {
            return;
        }

        let Some(mut entry) = track.buffer.remove(&nonce) else {
            return;
        };
        if track.is_idle() && track.buffer.is_empty() {
            state.tracks.remove(&key);
        }
        state.total -= 1;
        metrics::set_buffered_requests(state.total);
        drop(guard);

        // This runs on the expiry task itself
        entry.expiry = None;
        let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
        entry.reject(QueueError::PendingTimeout { waited_ms });
    }

    /// Runs the track's requests one after another until the next expected
    /// nonce is not buffered.
    #[tracing::instrument(name = "nonce_queue_drain", skip_all, fields(track = %key))]
    async fn drain(self: Arc<Self>, key: TrackKey, mut head: Entry<P>) {
        loop {
            let nonce = head.request.nonce_value;
            let execution = self.execute(head).await;

            let next_nonce = match execution {
                Execution::Executed { consumed: true } => Some(nonce.saturating_add(1)),
                Execution::Executed { consumed: false } => match self.source.fetch_nonce(key).await
                {
                    Ok(fresh) => {
                        tracing::info!(nonce, fresh_nonce = fresh, "Resynced track nonce after failed request");
                        Some(fresh)
                    }
                    Err(e) => {
                        tracing::warn!(nonce, error = %e, "Failed to resync track nonce");
                        None
                    }
                },
                Execution::NotExecuted => None,
            };

            let mut guard = self.lock();
            let state = &mut *guard;
            state.total -= 1;

            let Some(track) = state.tracks.get_mut(&key) else {
                metrics::set_buffered_requests(state.total);
                return;
            };
            track.active = None;
            if let Some(next_nonce) = next_nonce {
                track.next_nonce = next_nonce;
            }
            let expected = track.next_nonce;

            // An emptied track stays around to remember the local nonce, which
            // can be ahead of what the chain reports.
            let stale = track.take_stale();
            let claimed = track.claim_next();
            state.total -= stale.len();
            metrics::set_buffered_requests(state.total);
            drop(guard);

            for entry in stale {
                let stale_nonce = entry.request.nonce_value;
                entry.reject(QueueError::NonceOutOfRange {
                    nonce: stale_nonce,
                    next_nonce: expected,
                    window: self.config.max_pending_per_track as u64,
                });
            }

            match claimed {
                Some(next) => head = next,
                None => return,
            }
        }
    }

    async fn execute(&self, head: Entry<P>) -> Execution {
        let QueuedRequest {
            request,
            responder,
            enqueued_at,
            ..
        } = head;

        let deadline = enqueued_at + self.config.max_pending_time;
        let permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                metrics::record_queue_rejection(QueueError::Shutdown.reason());
                let _ = responder.send(Err(QueueError::Shutdown));
                return Execution::NotExecuted;
            }
            Err(_) => {
                let error = QueueError::PendingTimeout {
                    waited_ms: enqueued_at.elapsed().as_millis() as u64,
                };
                tracing::debug!(nonce = request.nonce_value, "Request timed out waiting for an execution slot");
                metrics::record_queue_rejection(error.reason());
                let _ = responder.send(Err(error));
                return Execution::NotExecuted;
            }
        };

        tracing::debug!(
            nonce = request.nonce_value,
            queued_ms = enqueued_at.elapsed().as_millis() as u64,
            "Executing request"
        );
        let result = AssertUnwindSafe(self.processor.process(&request))
            .catch_unwind()
            .await;
        drop(permit);

        let elapsed = enqueued_at.elapsed().as_secs_f64();
        match result {
            Ok(output) => {
                let consumed = P::nonce_consumed(&output);
                metrics::record_request_queued_to_settled(
                    if consumed { "consumed" } else { "not_consumed" },
                    elapsed,
                );
                let _ = responder.send(Ok(output));
                Execution::Executed { consumed }
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "processor panicked".to_string());
                tracing::error!(nonce = request.nonce_value, error = %message, "Request processor panicked");
                metrics::record_request_queued_to_settled("panicked", elapsed);
                let error = QueueError::ProcessorFailed { message };
                metrics::record_queue_rejection(error.reason());
                let _ = responder.send(Err(error));
                Execution::Executed { consumed: false }
            }
        }
    }
}
