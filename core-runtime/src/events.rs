//! # Event Bus System
//!
//! Typed controller events published over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! A controller reports what it is doing on three channels of a single bus:
//! - **Lifecycle**: state transitions and cache-sync progress
//! - **Reflector**: lists, watches, relists and periodic resyncs
//! - **Worker**: per-key outcomes (synced, requeued, dropped, panicked)
//!
//! Events are observational. Nothing in the controller depends on them being
//! received, so emitting with no subscribers is not an error for callers that
//! ignore the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   emit   ┌───────────┐   subscribe   ┌────────────┐
//! │ Reflector ├─────────>│           ├──────────────>│ Dashboard  │
//! └───────────┘          │ EventBus  │               └────────────┘
//! ┌───────────┐   emit   │ (broadcast│   subscribe   ┌────────────┐
//! │  Workers  ├─────────>│  channel) ├──────────────>│   Tests    │
//! └───────────┘          └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{ControllerEvent, EventBus, WorkerEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.stream().filter(|e| matches!(e, ControllerEvent::Worker(_)));
//!
//! bus.emit(ControllerEvent::Worker(WorkerEvent::Synced {
//!     controller: "pods".to_string(),
//!     key: "default/web".to_string(),
//!     attempt: 1,
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Key reconciled");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events. Non-fatal.
//! - **`RecvError::Closed`**: every sender was dropped; the controller is gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Controller Event Types
// ============================================================================

/// Top-level event published by a controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum ControllerEvent {
    /// Controller lifecycle events
    Lifecycle(LifecycleEvent),
    /// Cache population events
    Reflector(ReflectorEvent),
    /// Per-key processing events
    Worker(WorkerEvent),
}

impl ControllerEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            ControllerEvent::Lifecycle(e) => e.description(),
            ControllerEvent::Reflector(e) => e.description(),
            ControllerEvent::Worker(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            ControllerEvent::Worker(WorkerEvent::Dropped { .. })
            | ControllerEvent::Worker(WorkerEvent::Panicked { .. }) => EventSeverity::Error,
            ControllerEvent::Lifecycle(LifecycleEvent::CacheSyncTimedOut { .. })
            | ControllerEvent::Reflector(ReflectorEvent::SourceFailed { .. })
            | ControllerEvent::Worker(WorkerEvent::Requeued { .. }) => EventSeverity::Warning,
            ControllerEvent::Lifecycle(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Name of the controller that emitted the event.
    pub fn controller(&self) -> &str {
        match self {
            ControllerEvent::Lifecycle(e) => match e {
                LifecycleEvent::StateChanged { controller, .. }
                | LifecycleEvent::CacheSynced { controller, .. }
                | LifecycleEvent::CacheSyncTimedOut { controller, .. } => controller,
            },
            ControllerEvent::Reflector(e) => match e {
                ReflectorEvent::Listed { controller, .. }
                | ReflectorEvent::SourceFailed { controller, .. }
                | ReflectorEvent::WatchEnded { controller, .. }
                | ReflectorEvent::Resynced { controller, .. } => controller,
            },
            ControllerEvent::Worker(e) => match e {
                WorkerEvent::Synced { controller, .. }
                | WorkerEvent::Requeued { controller, .. }
                | WorkerEvent::Dropped { controller, .. }
                | WorkerEvent::Panicked { controller, .. } => controller,
            },
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Lifecycle Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    /// Controller moved between lifecycle states.
    StateChanged {
        controller: String,
        from: String,
        to: String,
    },
    /// Initial list applied; workers are about to start.
    CacheSynced {
        controller: String,
        /// Objects in the cache once synced.
        items: usize,
    },
    /// One cache-sync wait ran out its budget. The wait is retried.
    CacheSyncTimedOut {
        controller: String,
        waited_ms: u64,
    },
}

impl LifecycleEvent {
    fn description(&self) -> &str {
        match self {
            LifecycleEvent::StateChanged { .. } => "Controller state changed",
            LifecycleEvent::CacheSynced { .. } => "Cache synced",
            LifecycleEvent::CacheSyncTimedOut { .. } => "Timed out waiting for cache sync",
        }
    }
}

// ============================================================================
// Reflector Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ReflectorEvent {
    /// A full list was applied to the cache.
    Listed {
        controller: String,
        items: usize,
        /// Keys removed because they were missing from the list.
        removed: usize,
        resource_version: Option<String>,
    },
    /// A list or watch call failed; the reflector backs off before retrying.
    SourceFailed {
        controller: String,
        /// `list` or `watch`
        operation: String,
        message: String,
        retry_in_ms: u64,
    },
    /// The watch stream ended and a relist follows.
    WatchEnded {
        controller: String,
        reason: String,
    },
    /// Every cached key was re-enqueued by the periodic resync.
    Resynced {
        controller: String,
        keys: usize,
    },
}

impl ReflectorEvent {
    fn description(&self) -> &str {
        match self {
            ReflectorEvent::Listed { .. } => "Listed source",
            ReflectorEvent::SourceFailed { .. } => "Source call failed",
            ReflectorEvent::WatchEnded { .. } => "Watch ended",
            ReflectorEvent::Resynced { .. } => "Periodic resync",
        }
    }
}

// ============================================================================
// Worker Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum WorkerEvent {
    /// The handler succeeded for a key.
    Synced {
        controller: String,
        key: String,
        /// 1-based delivery number.
        attempt: u32,
    },
    /// The handler failed and the key was scheduled for a rate-limited retry.
    Requeued {
        controller: String,
        key: String,
        attempt: u32,
        message: String,
    },
    /// The key exhausted its retries and was dropped.
    Dropped {
        controller: String,
        key: String,
        attempts: u32,
        message: String,
    },
    /// The handler panicked. Treated as a failure of that delivery.
    Panicked {
        controller: String,
        key: String,
        message: String,
    },
}

impl WorkerEvent {
    fn description(&self) -> &str {
        match self {
            WorkerEvent::Synced { .. } => "Key reconciled",
            WorkerEvent::Requeued { .. } => "Key requeued after failure",
            WorkerEvent::Dropped { .. } => "Key dropped after exhausting retries",
            WorkerEvent::Panicked { .. } => "Handler panicked",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast channel carrying [`ControllerEvent`]s.
///
/// Cloning the bus clones the sender; every clone publishes to the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   A subscriber that falls further behind receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: ControllerEvent) -> Result<usize, SendError<ControllerEvent>> {
        self.sender.send(event)
    }

    /// Creates a new raw subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<ControllerEvent> {
        self.sender.subscribe()
    }

    /// Creates a new subscriber wrapped in an [`EventStream`].
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&ControllerEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with optional filtering.
pub struct EventStream {
    receiver: Receiver<ControllerEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<ControllerEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv`/`try_recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ControllerEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &ControllerEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<ControllerEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<ControllerEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn synced(key: &str) -> ControllerEvent {
        ControllerEvent::Worker(WorkerEvent::Synced {
            controller: "pods".to_string(),
            key: key.to_string(),
            attempt: 1,
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.stream();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::default();
        assert!(bus.emit(synced("default/a")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = ControllerEvent::Lifecycle(LifecycleEvent::StateChanged {
            controller: "pods".to_string(),
            from: "syncing".to_string(),
            to: "running".to_string(),
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = bus
            .stream()
            .filter(|event| matches!(event, ControllerEvent::Reflector(_)));

        bus.emit(synced("default/a")).ok();

        let listed = ControllerEvent::Reflector(ReflectorEvent::Listed {
            controller: "pods".to_string(),
            items: 3,
            removed: 1,
            resource_version: Some("42".to_string()),
        });
        bus.emit(listed.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), listed);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(synced(&format!("default/{}", i))).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let dropped = ControllerEvent::Worker(WorkerEvent::Dropped {
            controller: "pods".to_string(),
            key: "default/a".to_string(),
            attempts: 5,
            message: "boom".to_string(),
        });
        assert_eq!(dropped.severity(), EventSeverity::Error);

        let timed_out = ControllerEvent::Lifecycle(LifecycleEvent::CacheSyncTimedOut {
            controller: "pods".to_string(),
            waited_ms: 30_000,
        });
        assert_eq!(timed_out.severity(), EventSeverity::Warning);

        let synced_cache = ControllerEvent::Lifecycle(LifecycleEvent::CacheSynced {
            controller: "pods".to_string(),
            items: 0,
        });
        assert_eq!(synced_cache.severity(), EventSeverity::Info);

        assert_eq!(synced("default/a").severity(), EventSeverity::Debug);

        let watch_failed = ControllerEvent::Reflector(ReflectorEvent::SourceFailed {
            controller: "pods".to_string(),
            operation: "watch".to_string(),
            message: "Source unavailable: reset".to_string(),
            retry_in_ms: 800,
        });
        assert_eq!(watch_failed.severity(), EventSeverity::Warning);
        assert_eq!(watch_failed.description(), "Source call failed");
        assert_eq!(watch_failed.controller(), "pods");
    }

    #[test]
    fn test_event_description_and_controller() {
        let event = ControllerEvent::Reflector(ReflectorEvent::WatchEnded {
            controller: "nodes".to_string(),
            reason: "closed by server".to_string(),
        });
        assert_eq!(event.description(), "Watch ended");
        assert_eq!(event.controller(), "nodes");
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = tokio::spawn(async move {
            for i in 0..10 {
                bus1.emit(synced(&format!("a/{}", i))).ok();
            }
        });
        let handle2 = tokio::spawn(async move {
            for i in 0..10 {
                bus2.emit(synced(&format!("b/{}", i))).ok();
            }
        });

        handle1.await.ok();
        handle2.await.ok();

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = ControllerEvent::Worker(WorkerEvent::Requeued {
            controller: "pods".to_string(),
            key: "default/web".to_string(),
            attempt: 2,
            message: "conflict".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Worker\""));
        assert!(json.contains("\"event\":\"Requeued\""));

        let deserialized: ControllerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_try_recv() {
        let bus = EventBus::new(10);
        let mut stream = bus.stream();
        assert!(stream.try_recv().is_none());

        bus.emit(synced("default/a")).ok();
        let received = stream.try_recv().unwrap().unwrap();
        assert_eq!(received, synced("default/a"));
    }
}
