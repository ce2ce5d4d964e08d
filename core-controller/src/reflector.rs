//! # Reflector
//!
//! Keeps the [`Store`] in step with a [`ListWatcher`] source and feeds every
//! changed key into the work queue.
//!
//! ## Loop
//!
//! 1. List the source and replace the store contents. Keys that vanished are
//!    enqueued as deletions, every listed key is enqueued. The first
//!    successful list opens the cache-sync barrier.
//! 2. Watch from the listed resource version. Each event is written to the
//!    store first and its key enqueued second.
//! 3. When the watch ends or fails, go back to 1.
//!
//! Every relist waits out the current backoff delay, whether the list failed
//! or the watch ended. The delay doubles up to its cap and only drops back to
//! its initial value once a watch has stayed open for
//! [`HEALTHY_WATCH_PERIOD`]. Nothing is escalated; the loop only exits when
//! its cancellation token fires.

use bridge_traits::{BridgeError, ListResult, ListWatcher, Resource, WatchEvent};
use core_runtime::config::BackoffConfig;
use core_runtime::events::{ControllerEvent, EventBus, ReflectorEvent};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::barrier::CacheSyncBarrier;
use crate::key::{deletion_handling_key, meta_namespace_key, ObjectKey};
use crate::queue::RateLimitingQueue;
use crate::store::Store;

/// A watch open at least this long resets the relist backoff
pub const HEALTHY_WATCH_PERIOD: Duration = Duration::from_secs(120);

/// Why a watch stopped
enum WatchOutcome {
    Cancelled,
    /// Closed or expired; relist quietly
    Relist(String),
    /// Report, then relist
    Failed(BridgeError),
}

pub struct Reflector<T: Resource> {
    name: String,
    source: Arc<dyn ListWatcher<T>>,
    store: Arc<Store<T>>,
    queue: Arc<RateLimitingQueue>,
    barrier: Arc<CacheSyncBarrier>,
    backoff: BackoffConfig,
    resync_period: Option<Duration>,
    events: EventBus,
}

impl<T: Resource> Reflector<T> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ListWatcher<T>>,
        store: Arc<Store<T>>,
        queue: Arc<RateLimitingQueue>,
        barrier: Arc<CacheSyncBarrier>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            store,
            queue,
            barrier,
            backoff: BackoffConfig::default(),
            resync_period: None,
            events: EventBus::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn has_synced(&self) -> bool {
        self.barrier.has_synced()
    }

    /// List and watch until `cancel` fires
    #[instrument(skip_all, fields(controller = %self.name))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut delay = self.backoff.initial();
        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!("Starting reflector");

        loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                listed = self.source.list() => listed,
            };

            let resource_version = match listed {
                Ok(list) => self.apply_list(list),
                Err(err) => {
                    self.report_failure("list", &err, delay);
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    delay = self.next_delay(delay);
                    continue;
                }
            };

            let opened_at = Instant::now();
            let outcome = self.watch(resource_version, &mut resync, &cancel).await;
            if opened_at.elapsed() >= HEALTHY_WATCH_PERIOD {
                delay = self.backoff.initial();
            }

            match outcome {
                WatchOutcome::Cancelled => break,
                WatchOutcome::Relist(reason) => {
                    debug!(
                        reason = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "Watch ended, relisting"
                    );
                    self.emit(ReflectorEvent::WatchEnded {
                        controller: self.name.clone(),
                        reason,
                    });
                }
                WatchOutcome::Failed(err) => {
                    self.emit(ReflectorEvent::WatchEnded {
                        controller: self.name.clone(),
                        reason: err.to_string(),
                    });
                    self.report_failure("watch", &err, delay);
                }
            }

            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
            delay = self.next_delay(delay);
        }

        info!("Reflector stopped");
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
        resync: &mut Option<Interval>,
        cancel: &CancellationToken,
    ) -> WatchOutcome {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            opened = self.source.watch(resource_version.clone()) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) if err.requires_relist() => return WatchOutcome::Relist(err.to_string()),
            Err(err) => return WatchOutcome::Failed(err),
        };

        debug!(resource_version = ?resource_version, "Watch opened");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = next_resync(resync) => self.resync(),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply_event(event),
                    Some(Err(err)) if err.requires_relist() => {
                        return WatchOutcome::Relist(err.to_string())
                    }
                    Some(Err(err)) => return WatchOutcome::Failed(err),
                    None => return WatchOutcome::Relist("watch stream closed".to_string()),
                },
            }
        }
    }

    /// Replace the store with a full listing and enqueue every affected key
    fn apply_list(&self, list: ListResult<T>) -> Option<String> {
        let items: Vec<(ObjectKey, T)> = list
            .items
            .into_iter()
            .map(|obj| (meta_namespace_key(&obj), obj))
            .collect();
        let listed: Vec<ObjectKey> = items.iter().map(|(key, _)| key.clone()).collect();

        let removed = self.store.replace(items);

        for key in &removed {
            debug!(key = %key, "Object vanished between lists");
            self.queue.add(key.clone());
        }
        for key in &listed {
            self.queue.add(key.clone());
        }

        if self.barrier.mark_synced() {
            info!(items = listed.len(), "Initial list applied, cache synced");
        } else {
            debug!(
                items = listed.len(),
                removed = removed.len(),
                resource_version = ?list.resource_version,
                "Relisted"
            );
        }

        self.emit(ReflectorEvent::Listed {
            controller: self.name.clone(),
            items: listed.len(),
            removed: removed.len(),
            resource_version: list.resource_version.clone(),
        });

        list.resource_version
    }

    fn apply_event(&self, event: WatchEvent<T>) {
        let kind = event.kind();
        let key = match event {
            WatchEvent::Added(obj) => {
                let key = meta_namespace_key(&obj);
                self.store.add(key.clone(), obj);
                key
            }
            WatchEvent::Updated(obj) => {
                let key = meta_namespace_key(&obj);
                self.store.update(key.clone(), obj);
                key
            }
            WatchEvent::Deleted(deleted) => {
                let key = deletion_handling_key(&deleted);
                self.store.delete(key.as_str());
                key
            }
        };

        debug!(key = %key, event = kind, "Applied watch event");
        self.queue.add(key);
    }

    fn resync(&self) {
        let keys = self.store.list_keys();
        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }

        debug!(keys = count, "Periodic resync");
        self.emit(ReflectorEvent::Resynced {
            controller: self.name.clone(),
            keys: count,
        });
    }

    fn report_failure(&self, operation: &str, err: &BridgeError, retry_in: Duration) {
        warn!(
            operation,
            error = %err,
            retry_in_ms = retry_in.as_millis() as u64,
            "Source call failed, backing off"
        );
        self.emit(ReflectorEvent::SourceFailed {
            controller: self.name.clone(),
            operation: operation.to_string(),
            message: err.to_string(),
            retry_in_ms: retry_in.as_millis() as u64,
        });
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = (delay.as_millis() as f64 * self.backoff.factor) as u64;
        Duration::from_millis(next).min(self.backoff.max())
    }

    fn emit(&self, event: ReflectorEvent) {
        self.events.emit(ControllerEvent::Reflector(event)).ok();
    }
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Returns `false` if cancelled before `delay` elapsed
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
