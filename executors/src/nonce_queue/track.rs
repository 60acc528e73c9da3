use std::collections::BTreeMap;

use alloy::primitives::{Address, aliases::U192};
use submitter_core::TrackKey;
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};

use super::error::QueueError;
use crate::metrics;

/// A request to execute `payload` at `nonce_value` on the `(account, nonce_track)` lane.
#[derive(Debug, Clone)]
pub struct SubmitRequest<T> {
    pub account: Address,
    pub nonce_track: U192,
    pub nonce_value: u64,
    pub payload: T,
}

impl<T> SubmitRequest<T> {
    pub fn new(account: Address, nonce_track: U192, nonce_value: u64, payload: T) -> Self {
        Self {
            account,
            nonce_track,
            nonce_value,
            payload,
        }
    }

    pub fn track_key(&self) -> TrackKey {
        TrackKey::new(self.account, self.nonce_track)
    }
}

pub(super) type Responder<O> = oneshot::Sender<Result<O, QueueError>>;

pub(super) struct QueuedRequest<T, O> {
    pub id: u64,
    pub request: SubmitRequest<T>,
    pub responder: Responder<O>,
    pub enqueued_at: Instant,
    pub expiry: Option<AbortHandle>,
}

impl<T, O> QueuedRequest<T, O> {
    pub fn cancel_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }

    pub fn reject(mut self, error: QueueError) {
        self.cancel_expiry();
        tracing::debug!(
            account = %self.request.account,
            nonce_track = %self.request.nonce_track,
            nonce = self.request.nonce_value,
            reason = error.reason(),
            "Rejected queued request"
        );
        metrics::record_queue_rejection(error.reason());
        // The caller may have gone away
        let _ = self.responder.send(Err(error));
    }
}

/// Buffered requests for one nonce track.
pub(super) struct Track<T, O> {
    pub next_nonce: u64,
    pub buffer: BTreeMap<u64, QueuedRequest<T, O>>,
    /// Nonce of the request handed to the drain task, if any.
    pub active: Option<u64>,
    pub created_seq: u64,
}

impl<T, O> Track<T, O> {
    pub fn new(next_nonce: u64, created_seq: u64) -> Self {
        Self {
            next_nonce,
            buffer: BTreeMap::new(),
            active: None,
            created_seq,
        }
    }

    /// Buffered plus executing.
    pub fn len(&self) -> usize {
        self.buffer.len() + usize::from(self.active.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Hands out the lowest buffered request if it is the next expected nonce
    /// and nothing is executing on this track.
    pub fn claim_next(&mut self) -> Option<QueuedRequest<T, O>> {
        if self.active.is_some() {
            return None;
        }

        let mut entry = self.buffer.first_entry()?;
        if *entry.key() != self.next_nonce {
            return None;
        }

        entry.get_mut().cancel_expiry();
        let (nonce, head) = entry.remove_entry();
        self.active = Some(nonce);
        Some(head)
    }

    /// Removes every buffered request below the next expected nonce.
    pub fn take_stale(&mut self) -> Vec<QueuedRequest<T, O>> {
        let fresh = self.buffer.split_off(&self.next_nonce);
        std::mem::replace(&mut self.buffer, fresh)
            .into_values()
            .collect()
    }
}
