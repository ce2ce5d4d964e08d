//! Handler and error-sink contracts
//!
//! A [`SyncHandler`] reconciles one key. It reads the *current* object from
//! the store; a missing object means the object was deleted and is a normal,
//! successful case. Handlers only read the store; its writers are private to
//! the reflector. Handlers must be idempotent: the same key can be
//! delivered again after a failure, a resync or a coalesced burst of events.
//!
//! Keys that exhaust their retries are reported once to an [`ErrorSink`].

use async_trait::async_trait;
use bridge_traits::Resource;
use tokio::sync::mpsc;
use tracing::error;

use crate::error::SyncError;
use crate::key::ObjectKey;
use crate::store::Store;

#[async_trait]
pub trait SyncHandler<T: Resource>: Send + Sync {
    /// Drive the world towards the state cached under `key`
    async fn sync(&self, key: &ObjectKey, store: &Store<T>) -> Result<(), SyncError>;
}

/// Receives keys dropped after exhausting their retries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, key: &ObjectKey, error: &SyncError);
}

/// Logs dropped keys at error level
#[derive(Debug, Clone)]
pub struct TracingErrorSink {
    controller: String,
}

impl TracingErrorSink {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }
}

#[async_trait]
impl ErrorSink for TracingErrorSink {
    async fn report(&self, key: &ObjectKey, err: &SyncError) {
        error!(
            controller = %self.controller,
            key = %key,
            error = %err,
            "Dropping key out of the queue"
        );
    }
}

/// A dropped key with the error of its last delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedKey {
    pub key: ObjectKey,
    pub error: SyncError,
}

/// Forwards dropped keys to a channel, for hosts that react to them
#[derive(Debug, Clone)]
pub struct ChannelErrorSink {
    tx: mpsc::UnboundedSender<DroppedKey>,
}

impl ChannelErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DroppedKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ErrorSink for ChannelErrorSink {
    async fn report(&self, key: &ObjectKey, err: &SyncError) {
        let dropped = DroppedKey {
            key: key.clone(),
            error: err.clone(),
        };
        if self.tx.send(dropped).is_err() {
            error!(key = %key, error = %err, "Error sink receiver closed, dropping report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_error_sink_forwards() {
        let (sink, mut rx) = ChannelErrorSink::new();
        let key = ObjectKey::from("default/b");
        sink.report(&key, &SyncError::failed("boom")).await;

        let dropped = rx.recv().await.unwrap();
        assert_eq!(dropped.key, key);
        assert_eq!(dropped.error, SyncError::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_channel_error_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelErrorSink::new();
        drop(rx);
        sink.report(&ObjectKey::from("a"), &SyncError::failed("boom"))
            .await;
    }

    #[tokio::test]
    async fn test_tracing_error_sink_is_usable_as_trait_object() {
        let sink: Box<dyn ErrorSink> = Box::new(TracingErrorSink::new("pods"));
        sink.report(&ObjectKey::from("a"), &SyncError::Panicked("oops".to_string()))
            .await;
    }
}
