//! Core value types shared by the queue, engine and manager.

use kube::ResourceExt;
use std::fmt;

/// Identifier of a logical or physical cluster.
///
/// The empty identity means "no cluster": requests carrying it are treated
/// as cluster-unaware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterIdentity(String);

impl ClusterIdentity {
    /// Create an identity from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The empty identity.
    #[must_use]
    pub fn none() -> Self {
        Self(String::new())
    }

    /// The identity addressing every logical cluster at once (`*`).
    #[must_use]
    pub fn wildcard() -> Self {
        Self("*".to_string())
    }

    /// Returns `true` for the empty identity.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for ClusterIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ClusterIdentity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Namespace and name of an object within one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Build the key of any kube resource from its metadata.
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The unit of work handed to a reconciler.
///
/// Also the work queue key: two requests for the same object in different
/// clusters are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    /// Cluster the request is attributed to
    pub cluster: ClusterIdentity,
    /// Object to reconcile
    pub key: ObjectKey,
}

impl ReconcileRequest {
    /// Create a request.
    pub fn new(cluster: impl Into<ClusterIdentity>, key: ObjectKey) -> Self {
        Self {
            cluster: cluster.into(),
            key,
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.cluster, self.key)
    }
}

/// Kind of change observed by a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First time the cache sees the object
    Added,
    /// The object changed
    Updated,
    /// The object is gone; it may no longer be fetchable
    Deleted,
}

/// A change notification emitted by a cluster cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Cluster that produced the event
    pub cluster: ClusterIdentity,
    /// Kind of the object, e.g. `Widget`
    pub kind: String,
    /// Object the event is about
    pub key: ObjectKey,
    /// What happened
    pub event_type: EventType,
}
