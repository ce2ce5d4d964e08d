//! Rate-limited work queue
//!
//! The queue workers consume. Failures are re-added through
//! [`RateLimitingQueue::add_rate_limited`], which asks the rate limiter how
//! long the key has to wait.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::delaying::DelayingQueue;
use super::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use crate::key::ObjectKey;

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Keys ready to be handed out
    pub queued: usize,
    /// Keys handed out and not yet done
    pub processing: usize,
    /// Keys waiting for a delay to elapse
    pub waiting: usize,
    /// Keys accepted by `add` (coalesced adds are not counted)
    pub total_adds: u64,
    /// Calls to `add_rate_limited`
    pub total_retries: u64,
    pub shutting_down: bool,
}

impl QueueStats {
    /// Nothing queued, waiting or processing
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.processing == 0 && self.waiting == 0
    }
}

pub struct RateLimitingQueue {
    queue: DelayingQueue,
    limiter: Arc<dyn RateLimiter>,
    total_retries: AtomicU64,
}

impl RateLimitingQueue {
    /// Must be called from within a Tokio runtime.
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            queue: DelayingQueue::new(),
            limiter,
            total_retries: AtomicU64::new(0),
        }
    }

    /// Queue using [`default_controller_rate_limiter`]
    pub fn with_default_limiter() -> Self {
        Self::new(Arc::new(default_controller_rate_limiter()))
    }

    pub fn add(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// Re-add `key` after the delay chosen by the rate limiter
    ///
    /// Returns the delay.
    pub fn add_rate_limited(&self, key: ObjectKey) -> Duration {
        let delay = self.limiter.when(&key);
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Rate limited requeue");
        self.queue.add_after(key, delay);
        delay
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiter.num_requeues(key)
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

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub async fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queue.len(),
            processing: self.queue.processing_len(),
            waiting: self.queue.waiting_len(),
            total_adds: self.queue.total_adds(),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            shutting_down: self.queue.is_shutting_down(),
        }
    }
}

impl std::fmt::Debug for RateLimitingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("stats", &self.stats())
            .finish()
    }
}
