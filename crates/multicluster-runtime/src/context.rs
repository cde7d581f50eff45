//! Request-scoped context carrying the logical cluster.
//!
//! A [`Context`] bundles the process-wide cancellation signal with an
//! optional [`ClusterIdentity`]. The engine attaches the identity of every
//! request before calling a reconciler, and cluster clients read it back to
//! route their calls.

use crate::types::ClusterIdentity;
use tokio_util::sync::CancellationToken;

/// Object annotation naming the logical cluster an object lives in.
pub const LOGICAL_CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

/// Cancellation signal plus the logical cluster of the current request.
///
/// Contexts are immutable: deriving one never changes the original.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    cluster: Option<ClusterIdentity>,
}

impl Context {
    /// A context that is never cancelled and carries no cluster.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context tied to `token`.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cluster: None,
        }
    }

    /// Derive a context carrying `cluster`.
    #[must_use]
    pub fn with_cluster(&self, cluster: ClusterIdentity) -> Self {
        Self {
            token: self.token.clone(),
            cluster: Some(cluster),
        }
    }

    /// The attached cluster, or the empty identity if none was attached.
    #[must_use]
    pub fn cluster(&self) -> ClusterIdentity {
        self.cluster.clone().unwrap_or_default()
    }

    /// Derive a context whose cancellation can be triggered independently
    /// but which is also cancelled with its parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cluster: self.cluster.clone(),
        }
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// The logical cluster an object is annotated with, if any.
pub fn logical_cluster_of<K: kube::Resource>(object: &K) -> Option<ClusterIdentity> {
    object
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LOGICAL_CLUSTER_ANNOTATION))
        .filter(|cluster| !cluster.is_empty())
        .map(|cluster| ClusterIdentity::new(cluster.as_str()))
}

/// Return a copy of `ctx` carrying `cluster`.
#[must_use]
pub fn with_cluster(ctx: &Context, cluster: ClusterIdentity) -> Context {
    ctx.with_cluster(cluster)
}

/// The cluster attached to `ctx`, or the empty identity.
#[must_use]
pub fn cluster_from(ctx: &Context) -> ClusterIdentity {
    ctx.cluster()
}
