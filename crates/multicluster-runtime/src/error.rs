//! Error types of the multi-cluster runtime.

use crate::types::ClusterIdentity;
use thiserror::Error;

/// Errors returned by a [`ClusterClient`](crate::ClusterClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The request context was cancelled before the call finished
    #[error("Request cancelled")]
    Cancelled,

    /// Object could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g., missing name)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client could not be built for the requested cluster
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by a [`ClusterCache`](crate::ClusterCache).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cluster could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A watch loop ended unexpectedly
    #[error("Watch failed: {0}")]
    Watch(String),
}

/// Errors returned by the [`Manager`](crate::Manager).
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `register` was called twice for the same identity
    #[error("Cluster already registered: {0}")]
    AlreadyRegistered(ClusterIdentity),

    /// No cluster is registered under the identity
    #[error("Cluster not registered: {0}")]
    NotRegistered(ClusterIdentity),

    /// Registrations and watches are fixed once the manager starts
    #[error("Manager already started")]
    AlreadyStarted,

    /// A cluster cache failed to start
    #[error("Cache for cluster {cluster} failed to start: {source}")]
    CacheStart {
        /// Cluster whose cache failed
        cluster: ClusterIdentity,
        /// Underlying failure
        #[source]
        source: CacheError,
    },

    /// A running cluster cache failed
    #[error("Cache for cluster {cluster} failed: {source}")]
    CacheFailed {
        /// Cluster whose cache failed
        cluster: ClusterIdentity,
        /// Underlying failure
        #[source]
        source: CacheError,
    },
}
