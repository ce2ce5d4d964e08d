//! Cache keys
//!
//! Objects are addressed by `namespace/name`, or `name` for cluster-scoped
//! objects. The same key is derived from a live object and from a deletion
//! that only carries a tombstone.

use bridge_traits::{DeletedObject, Resource};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::error::{ControllerError, Result};

/// Key identifying one object in the cache and the work queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from its parts
    pub fn from_parts(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Split into `(namespace, name)`
    pub fn split(&self) -> Result<(Option<&str>, &str)> {
        split_key(&self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Key of a live object
pub fn meta_namespace_key<T: Resource>(obj: &T) -> ObjectKey {
    ObjectKey::from_parts(obj.namespace(), obj.name())
}

/// Key of a deleted object, whether or not its final state is known
pub fn deletion_handling_key<T: Resource>(deleted: &DeletedObject<T>) -> ObjectKey {
    match deleted {
        DeletedObject::Final(obj) => meta_namespace_key(obj),
        DeletedObject::FinalStateUnknown { key } => ObjectKey::new(key.clone()),
    }
}

/// Inverse of [`meta_namespace_key`]
///
/// # Errors
///
/// Returns `ControllerError::InvalidKey` when the key has more than one `/`
/// or an empty name.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let invalid = |reason: &str| ControllerError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(ns), Some(name), None) if !name.is_empty() => {
            if ns.is_empty() {
                Ok((None, name))
            } else {
                Ok((Some(ns), name))
            }
        }
        (_, _, Some(_)) => Err(invalid("expected at most one '/'")),
        _ => Err(invalid("name must not be empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::ObjectMeta;
    use std::collections::HashMap;

    #[test]
    fn test_meta_namespace_key() {
        let namespaced = ObjectMeta::namespaced("default", "web");
        assert_eq!(meta_namespace_key(&namespaced).as_str(), "default/web");

        let cluster = ObjectMeta::cluster_scoped("node-1");
        assert_eq!(meta_namespace_key(&cluster).as_str(), "node-1");
    }

    #[test]
    fn test_empty_namespace_is_cluster_scoped() {
        let meta = ObjectMeta::namespaced("", "node-1");
        assert_eq!(meta_namespace_key(&meta).as_str(), "node-1");
    }

    #[test]
    fn test_deletion_handling_key() {
        let live = DeletedObject::Final(ObjectMeta::namespaced("kube-system", "dns"));
        assert_eq!(deletion_handling_key(&live).as_str(), "kube-system/dns");

        let tombstone: DeletedObject<ObjectMeta> = DeletedObject::FinalStateUnknown {
            key: "default/gone".to_string(),
        };
        assert_eq!(deletion_handling_key(&tombstone).as_str(), "default/gone");
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("default/web").unwrap(), (Some("default"), "web"));
        assert_eq!(split_key("node-1").unwrap(), (None, "node-1"));
        assert_eq!(split_key("/node-1").unwrap(), (None, "node-1"));

        assert!(matches!(
            split_key("a/b/c"),
            Err(ControllerError::InvalidKey { .. })
        ));
        assert!(split_key("default/").is_err());
        assert!(split_key("").is_err());
    }

    #[test]
    fn test_split_round_trips_with_from_parts() {
        let key = ObjectKey::from_parts(Some("prod"), "api");
        let (ns, name) = key.split().unwrap();
        assert_eq!(ObjectKey::from_parts(ns, name), key);
    }

    #[test]
    fn test_borrow_as_str_in_maps() {
        let mut map = HashMap::new();
        map.insert(ObjectKey::from("default/a"), 1);
        assert_eq!(map.get("default/a"), Some(&1));
    }
}
