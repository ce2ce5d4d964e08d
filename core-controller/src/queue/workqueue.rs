//! # Work Queue
//!
//! Deduplicating FIFO of keys shared by producers (the reflector) and
//! consumers (workers).
//!
//! ## Guarantees
//!
//! - A key is queued at most once. Adding a key that is already queued is a
//!   no-op.
//! - A key handed out by [`WorkQueue::get`] is "processing" until
//!   [`WorkQueue::done`]. Adding it meanwhile marks it dirty and it is
//!   re-queued by `done`, so no two workers ever hold the same key.
//! - After [`WorkQueue::shut_down`], `get` returns `None` immediately and new
//!   keys are ignored.
//!
//! State lives under one `parking_lot::Mutex`; blocked consumers park on a
//! `tokio::sync::Notify`.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Notify;
use tracing::trace;

use crate::key::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing: queued, or re-added while processing
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
    total_adds: u64,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    /// Wakes consumers blocked in `get`
    available: Notify,
    /// Wakes `shut_down_with_drain` when processing empties
    drained: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                trace!(key = %key, "Ignoring add on shut down queue");
                return;
            }
            if state.dirty.contains(&key) {
                return;
            }

            state.total_adds += 1;
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Re-queued by done()
                return;
            }
            state.queue.push_back(key);
        }
        self.available.notify_one();
    }

    /// Block until a key is available
    ///
    /// Returns `None` once the queue is shutting down. The returned key must
    /// be passed to [`WorkQueue::done`] when processing finishes.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking state so an add in between is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &ObjectKey) {
        let (requeued, drained) = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            let requeued = state.dirty.contains(key);
            if requeued {
                state.queue.push_back(key.clone());
            }
            (requeued, state.processing.is_empty())
        };

        if requeued {
            self.available.notify_one();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys handed out and not yet `done`
    pub fn processing_len(&self) -> usize {
        self.state.lock().processing.len()
    }

    pub fn total_adds(&self) -> u64 {
        self.state.lock().total_adds
    }

    /// Stop accepting keys and release every blocked `get`
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
    }

    /// [`WorkQueue::shut_down`], then wait until every processing key is done
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.state.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
