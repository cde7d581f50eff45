//! The contract every reconciler implements.

use crate::context::Context;
use crate::types::ReconcileRequest;
use async_trait::async_trait;
use std::time::Duration;

/// Follow-up scheduling requested by a successful reconcile.
///
/// The default value means "done, wait for the next event".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue with rate-limited backoff
    pub requeue: bool,
    /// Requeue once this much time has passed
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing more to do until the object changes.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Retry with the queue's backoff.
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Check the object again after `delay`.
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// A unit of reconciliation logic driven by an [`Engine`](crate::Engine).
///
/// The engine never calls `reconcile` concurrently for the same request,
/// but does for distinct requests. The target object may already be gone
/// when `reconcile` runs.
///
/// Errors are always retried with backoff. Permanent problems should be
/// recorded on the object and reported as `Ok(ReconcileResult::done())`.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Error returned by a failed reconcile
    type Error: std::error::Error + Send + Sync + 'static;

    /// Converge the object named by `request`. `ctx` carries the request's
    /// cluster and the shutdown signal.
    async fn reconcile(
        &self,
        ctx: &Context,
        request: &ReconcileRequest,
    ) -> Result<ReconcileResult, Self::Error>;
}
