//! Cache-sync barrier
//!
//! One-shot gate between the reflector and the worker pool. The reflector
//! opens it after the first list has been applied to the store; it never
//! closes again.

use tokio::sync::watch;

#[derive(Debug)]
pub struct CacheSyncBarrier {
    tx: watch::Sender<bool>,
}

impl CacheSyncBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Open the barrier. Returns `true` only for the call that opened it.
    pub fn mark_synced(&self) -> bool {
        self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        })
    }

    pub fn has_synced(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the barrier is open
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl Default for CacheSyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_marks_once() {
        let barrier = CacheSyncBarrier::new();
        assert!(!barrier.has_synced());
        assert!(barrier.mark_synced());
        assert!(!barrier.mark_synced());
        assert!(barrier.has_synced());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_synced() {
        let barrier = CacheSyncBarrier::new();
        barrier.mark_synced();
        tokio::time::timeout(Duration::from_millis(100), barrier.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_synced() {
        let barrier = Arc::new(CacheSyncBarrier::new());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        barrier.mark_synced();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
