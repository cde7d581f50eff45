//! Widget Controller
//!
//! Watches Widgets in a reference cluster (a kcp workspace or APIExport
//! virtual workspace, or a plain Kubernetes cluster) and in a mirror
//! cluster, and reconciles them into the mirror cluster.

mod apiexport;
mod config;
mod controller;
mod error;
mod probes;
mod reconciler;
mod watcher;


use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use multicluster_runtime::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Widget Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Reference cluster: {}", config.reference_cluster);
    info!(
        "  Mirror cluster: {} ({})",
        config.mirror_cluster,
        config.mirror_kubeconfig.display()
    );
    info!(
        "  APIExport: {}",
        config.api_export_name.as_deref().unwrap_or("<only one>")
    );
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.concurrency);
    info!("  Probes: {}", config.probe_addr);

    let ctx = Context::new(CancellationToken::new());
    tokio::spawn(cancel_on_signal(ctx.clone()));

    // Initialize and run controller
    let controller = Controller::new(&config).await?;
    controller.run(ctx).await?;

    Ok(())
}

/// Cancels `ctx` on SIGINT or SIGTERM.
async fn cancel_on_signal(ctx: Context) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    ctx.cancel();
}
