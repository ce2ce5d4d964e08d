//! # Store / Indexer
//!
//! Thread-safe local cache mirroring the remote collection.
//!
//! ## Overview
//!
//! The store maps [`ObjectKey`]s to object snapshots. It has a single writer
//! (the reflector) and any number of readers (sync handlers); the write
//! methods are crate-private. All state sits
//! behind one `parking_lot::RwLock`, so a reader never observes a partially
//! applied write and secondary indices are always consistent with the items.
//!
//! ## Indices
//!
//! Index functions are registered at construction. Each maps an object to
//! zero or more index values, and the store keeps `value -> keys` sets up to
//! date on every write.
//!
//! ```ignore
//! use core_controller::store::{namespace_index, label_index, Store, NAMESPACE_INDEX};
//!
//! let store = Store::with_indexers([
//!     (NAMESPACE_INDEX.to_string(), namespace_index()),
//!     ("app".to_string(), label_index("app")),
//! ].into_iter().collect());
//!
//! let in_default = store.by_index(NAMESPACE_INDEX, "default")?;
//! ```

use bridge_traits::Resource;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{ControllerError, Result};
use crate::key::ObjectKey;
use crate::selector::LabelSelector;

/// Name under which [`namespace_index`] is conventionally registered
pub const NAMESPACE_INDEX: &str = "namespace";

/// Computes the index values of an object
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Index name to index function
pub type Indexers<T> = HashMap<String, IndexFunc<T>>;

/// Indexes objects by namespace. Cluster-scoped objects are not indexed.
pub fn namespace_index<T: Resource>() -> IndexFunc<T> {
    Arc::new(|obj: &T| {
        obj.namespace()
            .filter(|ns| !ns.is_empty())
            .map(|ns| vec![ns.to_string()])
            .unwrap_or_default()
    })
}

/// Indexes objects by the value of one label
pub fn label_index<T: Resource>(label: impl Into<String>) -> IndexFunc<T> {
    let label = label.into();
    Arc::new(move |obj: &T| {
        obj.labels()
            .get(&label)
            .map(|value| vec![value.clone()])
            .unwrap_or_default()
    })
}

struct StoreState<T> {
    items: HashMap<ObjectKey, T>,
    /// index name -> index value -> keys
    indices: HashMap<String, HashMap<String, BTreeSet<ObjectKey>>>,
}

/// Local key/object cache with secondary indices
///
/// Only the reflector writes. Outside this crate the store is read-only:
///
/// ```
/// use bridge_traits::ObjectMeta;
/// use core_controller::Store;
///
/// let store: Store<ObjectMeta> = Store::new();
/// assert!(store.get("default/a").is_none());
/// assert!(store.list_keys().is_empty());
/// ```
///
/// ```compile_fail
/// use bridge_traits::ObjectMeta;
/// use core_controller::{ObjectKey, Store};
///
/// let store: Store<ObjectMeta> = Store::new();
/// store.add(ObjectKey::from("default/a"), ObjectMeta::namespaced("default", "a"));
/// ```
pub struct Store<T: Resource> {
    state: RwLock<StoreState<T>>,
    indexers: Indexers<T>,
}

impl<T: Resource> Store<T> {
    pub fn new() -> Self {
        Self::with_indexers(Indexers::new())
    }

    pub fn with_indexers(indexers: Indexers<T>) -> Self {
        let indices = indexers
            .keys()
            .map(|name| (name.clone(), HashMap::new()))
            .collect();

        Self {
            state: RwLock::new(StoreState {
                items: HashMap::new(),
                indices,
            }),
            indexers,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &str) -> Option<T> {
        self.state.read().items.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.read().items.contains_key(key)
    }

    /// All cached objects, ordered by key
    pub fn list(&self) -> Vec<T> {
        let state = self.state.read();
        let mut entries: Vec<(&ObjectKey, &T)> = state.items.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    /// All cached keys, sorted
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.state.read().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    /// Objects whose labels satisfy `selector` (e.g. `app=web,tier==db`)
    pub fn list_by_labels(&self, selector: &str) -> Result<Vec<T>> {
        let selector = LabelSelector::parse(selector)?;
        Ok(self.list_matching(&selector))
    }

    pub fn list_matching(&self, selector: &LabelSelector) -> Vec<T> {
        self.list()
            .into_iter()
            .filter(|obj| selector.matches(obj.labels()))
            .collect()
    }

    // ========================================================================
    // Index queries
    // ========================================================================

    /// Objects whose `index_name` values include `value`
    pub fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<T>> {
        let state = self.state.read();
        let index = state
            .indices
            .get(index_name)
            .ok_or_else(|| ControllerError::IndexNotFound(index_name.to_string()))?;

        Ok(index
            .get(value)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.items.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Keys whose `index_name` values include `value`, sorted
    pub fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let state = self.state.read();
        let index = state
            .indices
            .get(index_name)
            .ok_or_else(|| ControllerError::IndexNotFound(index_name.to_string()))?;

        Ok(index
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Every value currently present in `index_name`, sorted
    pub fn list_index_values(&self, index_name: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let index = state
            .indices
            .get(index_name)
            .ok_or_else(|| ControllerError::IndexNotFound(index_name.to_string()))?;

        let mut values: Vec<String> = index.keys().cloned().collect();
        values.sort();
        Ok(values)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexers.keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert or overwrite the object stored under `key`
    pub(crate) fn add(&self, key: ObjectKey, obj: T) {
        let mut state = self.state.write();
        self.index_object(&mut state, &key, &obj);
        if let Some(old) = state.items.insert(key.clone(), obj) {
            self.unindex_object(&mut state, &key, &old, true);
        }
    }

    /// Same as [`Store::add`]
    pub(crate) fn update(&self, key: ObjectKey, obj: T) {
        self.add(key, obj);
    }

    /// Remove `key`, returning the last cached object
    pub(crate) fn delete(&self, key: &str) -> Option<T> {
        let mut state = self.state.write();
        let (key, old) = state.items.remove_entry(key)?;
        self.unindex_object(&mut state, &key, &old, false);
        Some(old)
    }

    /// Atomically replace the whole contents
    ///
    /// Returns the keys that were cached before but are absent from `items`,
    /// sorted.
    pub(crate) fn replace(&self, items: Vec<(ObjectKey, T)>) -> Vec<ObjectKey> {
        let mut state = self.state.write();

        let new_items: HashMap<ObjectKey, T> = items.into_iter().collect();
        let mut removed: Vec<ObjectKey> = state
            .items
            .keys()
            .filter(|key| !new_items.contains_key(*key))
            .cloned()
            .collect();
        removed.sort();

        for index in state.indices.values_mut() {
            index.clear();
        }
        for (key, obj) in &new_items {
            self.index_object(&mut state, key, obj);
        }
        state.items = new_items;

        removed
    }

    fn index_object(&self, state: &mut StoreState<T>, key: &ObjectKey, obj: &T) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = state.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    /// Drop `key` from the index values of `old`. When the key was just
    /// re-indexed with a new object, values still produced by that object
    /// are kept.
    fn unindex_object(&self, state: &mut StoreState<T>, key: &ObjectKey, old: &T, replaced: bool) {
        let current = if replaced {
            state.items.get(key).cloned()
        } else {
            None
        };

        for (name, index_fn) in &self.indexers {
            let still_present: Vec<String> = current
                .as_ref()
                .map(|obj| index_fn(obj))
                .unwrap_or_default();

            let Some(index) = state.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(old) {
                if still_present.contains(&value) {
                    continue;
                }
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.len())
            .field("indexers", &self.index_names())
            .finish()
    }
}
