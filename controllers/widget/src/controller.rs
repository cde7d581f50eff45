//! Main controller implementation.
//!
//! This module contains the `Controller` struct that connects the reference
//! and mirror clusters, subscribes the Widget engine to both and runs the
//! manager, the engine and the probe server until shutdown.

use crate::apiexport::{
    KCP_APIS_GROUP, kcp_apis_present, virtual_workspace_config, virtual_workspace_url,
};
use crate::config::Config;
use crate::error::ControllerError;
use crate::probes;
use crate::reconciler::WidgetReconciler;
use crate::watcher::watch_widgets;
use kube::config::{KubeConfigOptions, Kubeconfig};
use multicluster_runtime::{
    ClusterCache, ClusterClient, Context, Engine, KubeCluster, KubeClusterOptions, Manager,
    WatchHandle,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Client and cache of one cluster connection.
pub struct ClusterConnection {
    /// Reads and writes
    pub client: Arc<dyn ClusterClient>,
    /// Watches
    pub cache: Arc<dyn ClusterCache>,
}

impl From<KubeCluster> for ClusterConnection {
    fn from(cluster: KubeCluster) -> Self {
        Self {
            client: cluster.client,
            cache: cluster.cache,
        }
    }
}

/// Main controller for Widget mirroring.
pub struct Controller {
    manager: Arc<Manager>,
    engine: Engine,
    reconciler: Arc<WidgetReconciler>,
    concurrency: usize,
    probe_addr: SocketAddr,
    watches: Vec<WatchHandle>,
}

impl Controller {
    /// Connects to both clusters described by `config`.
    pub async fn new(config: &Config) -> Result<Self, ControllerError> {
        info!("Initializing Widget Controller");

        let reference = reference_cluster(config).await?;
        let mirror = mirror_cluster(config).await?;
        Self::with_clusters(config, reference, mirror)
    }

    /// Builds the controller around already established connections.
    pub fn with_clusters(
        config: &Config,
        reference: ClusterConnection,
        mirror: ClusterConnection,
    ) -> Result<Self, ControllerError> {
        let manager = Arc::new(Manager::new());
        manager.register(config.reference_cluster.clone(), reference.client, reference.cache)?;
        manager.register(config.mirror_cluster.clone(), mirror.client, mirror.cache)?;

        let engine = Engine::new("widget");
        let watches = watch_widgets(
            &manager,
            &engine,
            &config.reference_cluster,
            &config.mirror_cluster,
        )?;

        // Events come from both clusters, writes only go to the mirror
        let reconciler = Arc::new(WidgetReconciler::new(
            manager.client_for(&config.mirror_cluster)?,
        ));

        Ok(Self {
            manager,
            engine,
            reconciler,
            concurrency: config.concurrency,
            probe_addr: config.probe_addr,
            watches,
        })
    }

    /// Runs until `ctx` is cancelled or a cluster cache fails.
    pub async fn run(self, ctx: Context) -> Result<(), ControllerError> {
        let listener = TcpListener::bind(self.probe_addr).await.map_err(|e| {
            ControllerError::Probe(format!("failed to bind {}: {}", self.probe_addr, e))
        })?;

        // Engine and probes stop with the manager, also when it fails
        let workers = ctx.child();
        let probes = tokio::spawn(probes::serve(
            listener,
            Arc::clone(&self.manager),
            workers.clone(),
        ));
        let engine = tokio::spawn({
            let engine = self.engine.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let concurrency = self.concurrency;
            let workers = workers.clone();
            async move { engine.run(&workers, reconciler, concurrency).await }
        });

        info!("Widget Controller running");
        let result = self.manager.start(&ctx).await;

        workers.cancel();
        for watch in &self.watches {
            watch.cancel();
        }
        if let Err(e) = engine.await {
            error!("Engine task failed: {}", e);
        }
        if let Err(e) = probes.await {
            error!("Probe task failed: {}", e);
        }

        match result {
            Ok(()) => {
                info!("Widget Controller stopped");
                Ok(())
            }
            Err(e) => {
                error!("Widget Controller failed: {}", e);
                Err(e.into())
            }
        }
    }
}

fn cluster_options(config: &Config, logical_cluster_aware: bool) -> KubeClusterOptions {
    KubeClusterOptions {
        logical_cluster_aware,
        namespace: config.namespace.clone(),
        field_manager: config.field_manager.clone(),
    }
}

/// The reference cluster from the ambient kubeconfig, redirected to the
/// APIExport virtual workspace when the server is a kcp server.
async fn reference_cluster(config: &Config) -> Result<ClusterConnection, ControllerError> {
    let base = kube::Config::infer()
        .await
        .map_err(|e| ControllerError::KubeConfig(format!("reference cluster: {e}")))?;
    let client = kube::Client::try_from(base.clone())?;

    let (kube_config, logical_cluster_aware) = if kcp_apis_present(&client).await? {
        info!("Looking up virtual workspace URL");
        let url = virtual_workspace_url(&client, config.api_export_name.as_deref()).await?;
        info!("Using virtual workspace URL {}", url);
        (virtual_workspace_config(&base, &url)?, true)
    } else {
        info!(
            "The {} group is not present - using the reference cluster directly",
            KCP_APIS_GROUP
        );
        (base, false)
    };

    let cluster = KubeCluster::new(
        config.reference_cluster.clone(),
        kube_config,
        cluster_options(config, logical_cluster_aware),
    )?;
    Ok(cluster.into())
}

/// The mirror cluster from the kubeconfig file at `MIRROR_KUBECONFIG`.
async fn mirror_cluster(config: &Config) -> Result<ClusterConnection, ControllerError> {
    let path = &config.mirror_kubeconfig;
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        ControllerError::KubeConfig(format!("mirror cluster {}: {e}", path.display()))
    })?;
    let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            ControllerError::KubeConfig(format!("mirror cluster {}: {e}", path.display()))
        })?;

    let cluster = KubeCluster::new(
        config.mirror_cluster.clone(),
        kube_config,
        cluster_options(config, false),
    )?;
    Ok(cluster.into())
}
