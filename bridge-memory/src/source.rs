//! In-memory list/watch source

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    DeletedObject, ListResult, ListWatcher, Resource, WatchEvent, WatchStream,
};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Events retained for watch replay
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

type WatchSender<T> = mpsc::UnboundedSender<Result<WatchEvent<T>>>;

struct Inner<T> {
    objects: BTreeMap<String, T>,
    version: u64,
    /// `(version, event)` in version order
    history: VecDeque<(u64, WatchEvent<T>)>,
    /// Watches resuming at or before this version have lost events
    compacted_through: u64,
    watchers: Vec<WatchSender<T>>,
    failing_lists: u32,
    failing_watches: u32,
    list_calls: u64,
    watch_calls: u64,
}

/// A [`ListWatcher`] backed by an in-memory collection
///
/// Every write bumps a collection-wide version, stamps it on the object and
/// fans the change out to open watches. A watch opened at version `v` first
/// replays the retained events newer than `v`; if some of them have been
/// compacted away it fails with [`BridgeError::Expired`].
pub struct MemorySource<T: Resource> {
    inner: Mutex<Inner<T>>,
    history_limit: usize,
}

fn object_key<T: Resource>(obj: &T) -> String {
    match obj.namespace() {
        Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, obj.name()),
        _ => obj.name().to_string(),
    }
}

impl<T: Resource> MemorySource<T> {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// `limit` of 0 keeps no history, so every resumed watch expires
    /// once anything was written after its version.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                compacted_through: 0,
                watchers: Vec::new(),
                failing_lists: 0,
                failing_watches: 0,
                list_calls: 0,
                watch_calls: 0,
            }),
            history_limit: limit,
        }
    }

    /// Insert or replace an object, announced as `Added`
    ///
    /// Returns the stamped resource version.
    pub fn add(&self, obj: T) -> String {
        self.write(obj, WatchEvent::Added)
    }

    /// Insert or replace an object, announced as `Updated`
    pub fn update(&self, obj: T) -> String {
        self.write(obj, WatchEvent::Updated)
    }

    /// Remove the object under `key` and announce its final state
    pub fn delete(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        let mut obj = inner.objects.remove(key)?;
        let version = Self::next_version(&mut inner);
        obj.meta_mut().resource_version = Some(version.to_string());

        debug!(key, version, "Deleted object");
        self.publish(
            &mut inner,
            version,
            WatchEvent::Deleted(DeletedObject::Final(obj.clone())),
        );
        Some(obj)
    }

    /// Remove the object under `key` without telling any watcher
    ///
    /// Only a later list notices the object is gone.
    pub fn delete_silently(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        let removed = inner.objects.remove(key);
        if removed.is_some() {
            inner.version += 1;
        }
        removed
    }

    /// Announce the deletion of `key` with an unknown final state
    ///
    /// The key does not have to exist in the collection.
    pub fn announce_deleted(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.lock();
        inner.objects.remove(&key);
        let version = Self::next_version(&mut inner);

        debug!(key = %key, version, "Announced tombstone");
        self.publish(
            &mut inner,
            version,
            WatchEvent::Deleted(DeletedObject::FinalStateUnknown { key }),
        );
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }

    /// Current collection version
    pub fn resource_version(&self) -> String {
        self.inner.lock().version.to_string()
    }

    /// Make the next `count` calls to `list` fail
    pub fn fail_next_lists(&self, count: u32) {
        self.inner.lock().failing_lists = count;
    }

    /// Make the next `count` calls to `watch` fail
    pub fn fail_next_watches(&self, count: u32) {
        self.inner.lock().failing_watches = count;
    }

    /// End every open watch stream
    pub fn close_watches(&self) {
        let mut inner = self.inner.lock();
        debug!(watchers = inner.watchers.len(), "Closing watches");
        inner.watchers.clear();
    }

    /// Fail every open watch with [`BridgeError::Expired`] and end it
    pub fn expire_watches(&self) {
        let mut inner = self.inner.lock();
        let version = inner.version.to_string();
        for tx in inner.watchers.drain(..) {
            tx.unbounded_send(Err(BridgeError::Expired(version.clone())))
                .ok();
        }
    }

    /// Drop all retained history
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.compacted_through = inner.version;
    }

    pub fn list_calls(&self) -> u64 {
        self.inner.lock().list_calls
    }

    pub fn watch_calls(&self) -> u64 {
        self.inner.lock().watch_calls
    }

    /// Open watch streams whose receiver is still alive
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|tx| !tx.is_closed());
        inner.watchers.len()
    }

    fn write(&self, mut obj: T, event: fn(T) -> WatchEvent<T>) -> String {
        let key = object_key(&obj);
        let mut inner = self.inner.lock();
        let version = Self::next_version(&mut inner);
        obj.meta_mut().resource_version = Some(version.to_string());
        inner.objects.insert(key.clone(), obj.clone());

        let event = event(obj);
        debug!(key = %key, version, event = event.kind(), "Wrote object");
        self.publish(&mut inner, version, event);
        version.to_string()
    }

    fn next_version(inner: &mut Inner<T>) -> u64 {
        inner.version += 1;
        inner.version
    }

    fn publish(&self, inner: &mut Inner<T>, version: u64, event: WatchEvent<T>) {
        inner
            .watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());

        inner.history.push_back((version, event));
        while inner.history.len() > self.history_limit {
            if let Some((dropped, _)) = inner.history.pop_front() {
                inner.compacted_through = dropped;
            }
        }
    }
}

impl<T: Resource> Default for MemorySource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> ListWatcher<T> for MemorySource<T> {
    async fn list(&self) -> Result<ListResult<T>> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;

        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(BridgeError::SourceUnavailable(
                "injected list failure".to_string(),
            ));
        }

        let items: Vec<T> = inner.objects.values().cloned().collect();
        Ok(ListResult::new(items).with_resource_version(inner.version.to_string()))
    }

    async fn watch(&self, resource_version: Option<String>) -> Result<WatchStream<T>> {
        let mut inner = self.inner.lock();
        inner.watch_calls += 1;

        if inner.failing_watches > 0 {
            inner.failing_watches -= 1;
            return Err(BridgeError::SourceUnavailable(
                "injected watch failure".to_string(),
            ));
        }

        let from = match resource_version {
            Some(rv) => rv.parse::<u64>().map_err(|_| {
                BridgeError::OperationFailed(format!("Malformed resource version: {}", rv))
            })?,
            None => inner.version,
        };

        if from < inner.compacted_through {
            return Err(BridgeError::Expired(from.to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        for (version, event) in inner.history.iter() {
            if *version > from {
                tx.unbounded_send(Ok(event.clone())).ok();
            }
        }
        inner.watchers.push(tx);

        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::ObjectMeta;

    fn obj(name: &str) -> ObjectMeta {
        ObjectMeta::namespaced("default", name)
    }

    #[tokio::test]
    async fn test_list_returns_sorted_items_and_version() {
        let source = MemorySource::new();
        source.add(obj("b"));
        source.add(obj("a"));
        source.add(ObjectMeta::cluster_scoped("node-1"));

        let list = source.list().await.unwrap();
        let names: Vec<_> = list.items.iter().map(|o| o.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "node-1"]);
        assert_eq!(list.resource_version.as_deref(), Some("3"));
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_writes_stamp_resource_versions() {
        let source = MemorySource::new();
        assert_eq!(source.add(obj("a")), "1");
        assert_eq!(source.update(obj("a")), "2");
        assert_eq!(
            source.get("default/a").unwrap().resource_version.as_deref(),
            Some("2")
        );
        let deleted = source.delete("default/a").unwrap();
        assert_eq!(deleted.resource_version.as_deref(), Some("3"));
        assert!(source.delete("default/a").is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_after_version_then_streams_live() {
        let source = MemorySource::new();
        source.add(obj("a"));
        let list = source.list().await.unwrap();
        source.add(obj("b"));

        let mut stream = source.watch(list.resource_version).await.unwrap();
        source.update(obj("a"));
        source.delete("default/b");
        source.announce_deleted("default/ghost");

        let kinds: Vec<_> = stream
            .by_ref()
            .take(4)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert!(matches!(&kinds[0], WatchEvent::Added(o) if o.name == "b"));
        assert!(matches!(&kinds[1], WatchEvent::Updated(o) if o.name == "a"));
        assert!(matches!(&kinds[2], WatchEvent::Deleted(DeletedObject::Final(o)) if o.name == "b"));
        assert!(matches!(
            &kinds[3],
            WatchEvent::Deleted(DeletedObject::FinalStateUnknown { key }) if key == "default/ghost"
        ));
    }

    #[tokio::test]
    async fn test_compacted_history_expires_watch() {
        let source = MemorySource::new();
        source.add(obj("a"));
        source.add(obj("b"));
        source.compact();

        let err = source.watch(Some("1".to_string())).await.err().unwrap();
        assert!(matches!(err, BridgeError::Expired(_)));
        assert!(err.requires_relist());

        // Resuming from the current version is still fine
        assert!(source.watch(Some(source.resource_version())).await.is_ok());
    }

    #[tokio::test]
    async fn test_bounded_history_compacts_oldest() {
        let source = MemorySource::with_history_limit(2);
        for name in ["a", "b", "c", "d"] {
            source.add(obj(name));
        }
        assert!(source.watch(Some("1".to_string())).await.is_err());
        assert!(source.watch(Some("2".to_string())).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let source: MemorySource<ObjectMeta> = MemorySource::new();
        source.fail_next_lists(2);
        source.fail_next_watches(1);

        assert!(source.list().await.is_err());
        assert!(source.list().await.is_err());
        assert!(source.list().await.is_ok());
        assert!(source.watch(None).await.is_err());
        assert!(source.watch(None).await.is_ok());
        assert_eq!(source.list_calls(), 3);
        assert_eq!(source.watch_calls(), 2);
    }

    #[tokio::test]
    async fn test_close_and_expire_end_streams() {
        let source: MemorySource<ObjectMeta> = MemorySource::new();
        let mut closed = source.watch(None).await.unwrap();
        source.close_watches();
        assert!(closed.next().await.is_none());

        let mut expired = source.watch(None).await.unwrap();
        assert_eq!(source.watcher_count(), 1);
        source.expire_watches();
        assert!(matches!(
            expired.next().await,
            Some(Err(BridgeError::Expired(_)))
        ));
        assert!(expired.next().await.is_none());
        assert_eq!(source.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_silently_sends_nothing() {
        let source = MemorySource::new();
        source.add(obj("a"));
        let mut stream = source.watch(None).await.unwrap();

        assert!(source.delete_silently("default/a").is_some());
        source.close_watches();
        assert!(stream.next().await.is_none());
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_resource_version() {
        let source: MemorySource<ObjectMeta> = MemorySource::new();
        let err = source.watch(Some("abc".to_string())).await.err().unwrap();
        assert!(matches!(err, BridgeError::OperationFailed(_)));
    }
}
