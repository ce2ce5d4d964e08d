//! Delaying queue
//!
//! Wraps a [`WorkQueue`] with `add_after`. Pending keys are held in a
//! min-heap drained by one background timer task; a key has at most one
//! pending entry, always at its earliest requested ready time.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::workqueue::WorkQueue;
use crate::key::ObjectKey;

#[derive(Default)]
struct Waiting {
    /// (ready_at, sequence, key); superseded entries are skipped on pop
    heap: BinaryHeap<Reverse<(Instant, u64, ObjectKey)>>,
    /// Live entry per key
    entries: HashMap<ObjectKey, (Instant, u64)>,
    next_seq: u64,
}

impl Waiting {
    fn pop_ready(&mut self, now: Instant) -> Vec<ObjectKey> {
        let mut ready = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, seq, key))) = self.heap.pop() else {
                break;
            };
            if self.entries.get(&key).map(|(_, live)| *live) == Some(seq) {
                self.entries.remove(&key);
                ready.push(key);
            }
        }
        ready
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }
}

pub struct DelayingQueue {
    queue: Arc<WorkQueue>,
    waiting: Arc<Mutex<Waiting>>,
    wake: Arc<Notify>,
    stop: CancellationToken,
}

impl DelayingQueue {
    /// Create the queue and spawn its timer task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let queue = Arc::new(WorkQueue::new());
        let waiting = Arc::new(Mutex::new(Waiting::default()));
        let wake = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        tokio::spawn(run_timer(
            Arc::clone(&queue),
            Arc::clone(&waiting),
            Arc::clone(&wake),
            stop.clone(),
        ));

        Self {
            queue,
            waiting,
            wake,
            stop,
        }
    }

    pub fn add(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Add `key` once `delay` has elapsed
    ///
    /// A key already waiting keeps the earlier of its two ready times.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut waiting = self.waiting.lock();
            if let Some((existing, _)) = waiting.entries.get(&key) {
                if *existing <= ready_at {
                    return;
                }
            }
            waiting.next_seq += 1;
            let seq = waiting.next_seq;
            waiting.entries.insert(key.clone(), (ready_at, seq));
            waiting.heap.push(Reverse((ready_at, seq, key)));
        }
        self.wake.notify_one();
    }

    pub async fn get(&self) -> Option<ObjectKey> {
        self.queue.get().await
    }

    pub fn done(&self, key: &ObjectKey) {
        self.queue.done(key);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn processing_len(&self) -> usize {
        self.queue.processing_len()
    }

    /// Keys scheduled by `add_after` that are not yet queued
    pub fn waiting_len(&self) -> usize {
        self.waiting.lock().entries.len()
    }

    pub fn total_adds(&self) -> u64 {
        self.queue.total_adds()
    }

    pub fn shut_down(&self) {
        self.stop.cancel();
        self.queue.shut_down();
    }

    pub async fn shut_down_with_drain(&self) {
        self.stop.cancel();
        self.queue.shut_down_with_drain().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}

impl Drop for DelayingQueue {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_timer(
    queue: Arc<WorkQueue>,
    waiting: Arc<Mutex<Waiting>>,
    wake: Arc<Notify>,
    stop: CancellationToken,
) {
    loop {
        let (ready, next) = {
            let mut waiting = waiting.lock();
            let ready = waiting.pop_ready(Instant::now());
            (ready, waiting.next_ready_at())
        };

        for key in ready {
            trace!(key = %key, "Delay elapsed");
            queue.add(key);
        }

        let sleep_until = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep_until(sleep_until) => {}
        }
    }
}
