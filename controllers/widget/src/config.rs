//! Controller configuration.
//!
//! Everything is read from environment variables. Parsing goes through a
//! lookup function so it can be tested without touching the process
//! environment.

use crate::error::ControllerError;
use multicluster_runtime::ClusterIdentity;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default identity of the cluster Widgets are watched in
pub const DEFAULT_REFERENCE_CLUSTER: &str = "reference";
/// Default identity of the cluster Widgets are written to
pub const DEFAULT_MIRROR_CLUSTER: &str = "mirror";
/// Default probe listen address
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8081";
/// Default server-side apply field manager
pub const DEFAULT_FIELD_MANAGER: &str = "widget-controller";

/// Widget controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Kubeconfig file of the mirror cluster (`MIRROR_KUBECONFIG`)
    pub mirror_kubeconfig: PathBuf,
    /// APIExport to serve from, `None` to pick the only one (`API_EXPORT_NAME`)
    pub api_export_name: Option<String>,
    /// Number of reconcile workers (`RECONCILE_CONCURRENCY`)
    pub concurrency: usize,
    /// Identity of the reference cluster (`REFERENCE_CLUSTER_NAME`)
    pub reference_cluster: ClusterIdentity,
    /// Identity of the mirror cluster (`MIRROR_CLUSTER_NAME`)
    pub mirror_cluster: ClusterIdentity,
    /// Namespace to watch, `None` for all namespaces (`WATCH_NAMESPACE`)
    pub namespace: Option<String>,
    /// Listen address of the probe server (`PROBE_ADDR`)
    pub probe_addr: SocketAddr,
    /// Field manager for server-side apply (`FIELD_MANAGER`)
    pub field_manager: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mirror_kubeconfig = get("MIRROR_KUBECONFIG")
            .map(PathBuf::from)
            .ok_or_else(|| {
                ControllerError::InvalidConfig(
                    "MIRROR_KUBECONFIG environment variable is required".to_string(),
                )
            })?;

        let concurrency = match get("RECONCILE_CONCURRENCY") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!(
                        "RECONCILE_CONCURRENCY must be a positive integer, got {value:?}"
                    ))
                })?,
            None => 1,
        };

        let probe_addr_value = get("PROBE_ADDR").unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string());
        let probe_addr = probe_addr_value.trim().parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("invalid PROBE_ADDR {probe_addr_value:?}: {e}"))
        })?;

        let reference_cluster = ClusterIdentity::new(
            get("REFERENCE_CLUSTER_NAME").unwrap_or_else(|| DEFAULT_REFERENCE_CLUSTER.to_string()),
        );
        let mirror_cluster = ClusterIdentity::new(
            get("MIRROR_CLUSTER_NAME").unwrap_or_else(|| DEFAULT_MIRROR_CLUSTER.to_string()),
        );
        if reference_cluster == mirror_cluster {
            return Err(ControllerError::InvalidConfig(format!(
                "reference and mirror clusters must differ, both are {reference_cluster}"
            )));
        }

        Ok(Self {
            mirror_kubeconfig,
            api_export_name: get("API_EXPORT_NAME"),
            concurrency,
            reference_cluster,
            mirror_cluster,
            namespace: get("WATCH_NAMESPACE"),
            probe_addr,
            field_manager: get("FIELD_MANAGER").unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
        })
    }
}
