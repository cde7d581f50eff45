//! Liveness and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use multicluster_runtime::{Context, Manager};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Probe routes: `/healthz` always answers, `/readyz` once every cluster
/// cache is running.
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(manager)
}

async fn readyz(State(manager): State<Arc<Manager>>) -> (StatusCode, &'static str) {
    if manager.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not running")
    }
}

/// Serve the probes on `listener` until `ctx` is cancelled.
pub async fn serve(listener: TcpListener, manager: Arc<Manager>, ctx: Context) {
    if let Ok(addr) = listener.local_addr() {
        info!("Serving probes on {}", addr);
    }
    let shutdown = async move { ctx.cancelled().await };
    if let Err(e) = axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Probe server failed: {}", e);
    }
}
