//! List/Watch Source
//!
//! The remote, authoritative store a controller mirrors. A source offers two
//! operations: a consistent snapshot of the whole collection and a lazy stream
//! of changes starting after that snapshot.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{error::Result, resource::Resource};

/// Snapshot returned by [`ListWatcher::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult<T> {
    /// Every object currently in the collection
    pub items: Vec<T>,
    /// Version of the collection the snapshot was taken at, used to resume
    /// the subsequent watch without gaps
    pub resource_version: Option<String>,
}

impl<T> ListResult<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            resource_version: None,
        }
    }

    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

/// Final state of a deleted object
///
/// A delete is normally observed with the last known object. When the delete
/// was inferred (the object vanished between two lists) only its cache key is
/// known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DeletedObject<T> {
    /// The last state of the object before deletion
    Final(T),
    /// The object is gone but its final state was never observed
    FinalStateUnknown { key: String },
}

impl<T: Resource> DeletedObject<T> {
    /// The object, if its final state is known
    pub fn object(&self) -> Option<&T> {
        match self {
            DeletedObject::Final(obj) => Some(obj),
            DeletedObject::FinalStateUnknown { .. } => None,
        }
    }
}

/// A single change observed on the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(DeletedObject<T>),
}

impl<T> WatchEvent<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

/// Change stream returned by [`ListWatcher::watch`]
///
/// The stream ends when the source closes the watch. Errors are yielded in
/// band; a consumer should treat any error as the end of the stream.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>>>;

/// List/watch capability over one resource collection
///
/// Implementations must not retry internally. The reflector driving a source
/// retries failed lists and restarts closed watches with its own backoff.
#[async_trait]
pub trait ListWatcher<T: Resource>: Send + Sync {
    /// Take a full snapshot of the collection
    async fn list(&self) -> Result<ListResult<T>>;

    /// Open a change stream
    ///
    /// # Arguments
    ///
    /// * `resource_version` - Version returned by the preceding list. Events
    ///   at or before this version must not be replayed.
    async fn watch(&self, resource_version: Option<String>) -> Result<WatchStream<T>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::resource::ObjectMeta;
    use futures::StreamExt;
    use mockall::mock;

    mock! {
        Source {}

        #[async_trait]
        impl ListWatcher<ObjectMeta> for Source {
            async fn list(&self) -> Result<ListResult<ObjectMeta>>;
            async fn watch(&self, resource_version: Option<String>) -> Result<WatchStream<ObjectMeta>>;
        }
    }

    #[test]
    fn test_watch_event_kind() {
        let meta = ObjectMeta::namespaced("default", "a");
        assert_eq!(WatchEvent::Added(meta.clone()).kind(), "added");
        assert_eq!(WatchEvent::Updated(meta.clone()).kind(), "updated");
        assert_eq!(
            WatchEvent::Deleted(DeletedObject::Final(meta)).kind(),
            "deleted"
        );
    }

    #[test]
    fn test_deleted_object_accessor() {
        let meta = ObjectMeta::namespaced("default", "a");
        assert_eq!(
            DeletedObject::Final(meta.clone()).object(),
            Some(&meta)
        );

        let unknown: DeletedObject<ObjectMeta> = DeletedObject::FinalStateUnknown {
            key: "default/a".to_string(),
        };
        assert!(unknown.object().is_none());
    }

    #[test]
    fn test_list_result_builder() {
        let list = ListResult::new(vec![ObjectMeta::cluster_scoped("n1")])
            .with_resource_version("12");
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.resource_version, Some("12".to_string()));
    }

    #[tokio::test]
    async fn test_mock_source_through_trait_object() {
        let mut source = MockSource::new();
        source.expect_list().times(1).returning(|| {
            Ok(ListResult::new(vec![ObjectMeta::namespaced("default", "a")])
                .with_resource_version("1"))
        });
        source
            .expect_watch()
            .withf(|rv| rv.as_deref() == Some("1"))
            .times(1)
            .returning(|_| {
                let events = vec![
                    Ok(WatchEvent::Added(ObjectMeta::namespaced("default", "b"))),
                    Err(BridgeError::WatchClosed("server timeout".to_string())),
                ];
                Ok(futures::stream::iter(events).boxed())
            });

        let source: Box<dyn ListWatcher<ObjectMeta>> = Box::new(source);
        let list = source.list().await.unwrap();
        let mut stream = source.watch(list.resource_version).await.unwrap();

        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Added(_)))));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.requires_relist());
        assert!(stream.next().await.is_none());
    }
}
