//! Controller-specific error types.
//!
//! This module defines error types specific to the Widget controller that
//! are not covered by the runtime's own errors.

use kube::Error as KubeError;
use multicluster_runtime::{ClientError, ManagerError};
use thiserror::Error;

/// Errors that can occur in the Widget controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    KubeConfig(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// APIExport lookup failed
    #[error("APIExport error: {0}")]
    ApiExport(String),

    /// Cluster client could not be built
    #[error("Cluster client error: {0}")]
    Client(#[from] ClientError),

    /// Multi-cluster manager error
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Probe(String),
}

/// Errors returned by the Widget reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Read or write against the mirror cluster failed
    #[error("Cluster client error: {0}")]
    Client(#[from] ClientError),

    /// Status could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
