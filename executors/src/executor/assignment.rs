use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alloy::primitives::{Address, B256, aliases::U192};
use submitter_core::{TrackKey, constants::DEFAULT_ASSIGNMENT_TTL};
use tokio::task::AbortHandle;

use super::{
    AssignmentError,
    heap::{ExecutorHeap, ExecutorSlot},
};
use crate::metrics;

struct HashTimer {
    generation: u64,
    abort: AbortHandle,
}

struct AssignmentEntry {
    executor: Address,
    hash_expirations: HashMap<B256, HashTimer>,
}

#[derive(Default)]
struct AssignmentState {
    heap: ExecutorHeap,
    entries: HashMap<TrackKey, AssignmentEntry>,
    next_generation: u64,
}

impl AssignmentState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Sticky executor selection per `(account, nonceTrack)`.
///
/// The first request on a track gets the least loaded executor. Later requests
/// on the same track reuse it for as long as at least one of its request
/// hashes is still live. Each hash lives for `ttl` after it was last seen and
/// counts as one job on its executor while it lives.
#[derive(Clone)]
pub struct ExecutorAssignment {
    state: Arc<Mutex<AssignmentState>>,
    ttl: Duration,
}

impl ExecutorAssignment {
    pub fn new(
        executors: impl IntoIterator<Item = Address>,
        ttl: Duration,
    ) -> Result<Self, AssignmentError> {
        let mut heap = ExecutorHeap::new();
        for executor in executors {
            heap.add(executor);
        }

        if heap.is_empty() {
            return Err(AssignmentError::NoExecutors);
        }

        let assignment = Self {
            state: Arc::new(Mutex::new(AssignmentState {
                heap,
                ..Default::default()
            })),
            ttl,
        };
        publish_job_counts(&assignment.lock());

        Ok(assignment)
    }

    pub fn with_default_ttl(
        executors: impl IntoIterator<Item = Address>,
    ) -> Result<Self, AssignmentError> {
        Self::new(executors, DEFAULT_ASSIGNMENT_TTL)
    }

    /// Adds an executor to the pool. Returns `false` if it was already present.
    pub fn register_executor(&self, executor: Address) -> bool {
        let mut state = self.lock();
        let added = state.heap.add(executor);
        if added {
            tracing::info!(executor = %executor, "Registered executor");
            publish_job_counts(&state);
        }
        added
    }

    /// Returns the executor for this track, refreshing the TTL of `request_hash`.
    ///
    /// Must be called from within a tokio runtime since expirations are timer tasks.
    pub fn get(
        &self,
        request_hash: B256,
        account: Address,
        nonce_track: U192,
    ) -> Result<Address, AssignmentError> {
        let key = TrackKey::new(account, nonce_track);
        let mut guard = self.lock();
        let state = &mut *guard;

        let executor = match state.entries.get(&key).map(|entry| entry.executor) {
            Some(executor) => executor,
            None => {
                let executor = state
                    .heap
                    .peek()
                    .map(|slot| slot.address)
                    .ok_or(AssignmentError::NoExecutors)?;

                tracing::debug!(track = %key, executor = %executor, "Assigned executor to track");
                state.entries.insert(
                    key,
                    AssignmentEntry {
                        executor,
                        hash_expirations: HashMap::new(),
                    },
                );
                executor
            }
        };

        let generation = state.next_generation();
        let abort = self.spawn_expiry(key, request_hash, generation);
        let timer = HashTimer { generation, abort };

        let Some(entry) = state.entries.get_mut(&key) else {
            return Err(AssignmentError::NoExecutors);
        };
        match entry.hash_expirations.insert(request_hash, timer) {
            Some(previous) => previous.abort.abort(),
            None => {
                state.heap.increment(&executor);
            }
        }

        publish_job_counts(state);
        Ok(executor)
    }

    /// `(executor, jobCount)` pairs in heap order.
    pub fn stats(&self) -> Vec<ExecutorSlot> {
        self.lock().heap.values()
    }

    /// Executor currently pinned to the track, if any.
    pub fn assigned(&self, account: Address, nonce_track: U192) -> Option<Address> {
        self.lock()
            .entries
            .get(&TrackKey::new(account, nonce_track))
            .map(|entry| entry.executor)
    }

    fn spawn_expiry(&self, key: TrackKey, hash: B256, generation: u64) -> AbortHandle {
        let this = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(this.ttl).await;

            let mut guard = this.lock();
            let state = &mut *guard;

            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            // A refresh replaced this timer after it had already fired
            if entry
                .hash_expirations
                .get(&hash)
                .is_none_or(|timer| timer.generation != generation)
            {
                return;
            }

            entry.hash_expirations.remove(&hash);
            let executor = entry.executor;
            if entry.hash_expirations.is_empty() {
                state.entries.remove(&key);
                tracing::debug!(track = %key, executor = %executor, "Executor assignment expired");
            }
            state.heap.decrement(&executor);
            publish_job_counts(state);
        })
        .abort_handle()
    }

    fn lock(&self) -> MutexGuard<'_, AssignmentState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn publish_job_counts(state: &AssignmentState) {
    for slot in state.heap.values() {
        metrics::set_executor_job_count(&slot.address, slot.job_count);
    }
}
