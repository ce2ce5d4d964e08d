//! Resource identity
//!
//! Every object flowing through a controller carries an [`ObjectMeta`]. The
//! core derives cache keys, namespace indices and label selections from it and
//! never looks at the rest of the payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity and bookkeeping metadata shared by all resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Free-form labels used by selectors and indices
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Opaque version assigned by the source on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Metadata for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

/// An object that can be cached and reconciled
///
/// Implementors only expose their metadata; snapshots are cloned into the
/// local cache, so they must be cheap enough to clone (wrap large payloads in
/// `Arc` if needed).
pub trait Resource: Clone + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;

    /// Mutable access, used by sources to stamp resource versions
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }
}

impl Resource for ObjectMeta {
    fn meta(&self) -> &ObjectMeta {
        self
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_meta() {
        let meta = ObjectMeta::namespaced("default", "web")
            .with_label("app", "nginx")
            .with_resource_version("42");

        assert_eq!(meta.name(), "web");
        assert_eq!(meta.namespace(), Some("default"));
        assert_eq!(meta.labels().get("app"), Some(&"nginx".to_string()));
        assert_eq!(meta.resource_version(), Some("42"));
    }

    #[test]
    fn test_cluster_scoped_meta() {
        let meta = ObjectMeta::cluster_scoped("node-1");
        assert_eq!(meta.namespace(), None);
        assert!(meta.labels().is_empty());
    }

    #[test]
    fn test_meta_serde_camel_case() {
        let meta = ObjectMeta::namespaced("default", "web").with_resource_version("7");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"resourceVersion\":\"7\""));
        assert!(!json.contains("labels"));

        let parsed: ObjectMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
