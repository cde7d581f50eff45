//! Widget reconciliation logic.
//!
//! Requests may come from either cluster, but the reconciler only ever
//! reads and writes the mirror cluster. A Widget that is gone from the
//! mirror is not an error: deletions still produce requests.

use crate::error::ReconcileError;
use async_trait::async_trait;
use crds::{Widget, WidgetStatus};
use kube::api::ApiResource;
use multicluster_runtime::{
    ClusterClient, Context, ReconcileRequest, ReconcileResult, Reconciler, decode, resource_of,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Reconciles Widgets into the mirror cluster.
pub struct WidgetReconciler {
    mirror: Arc<dyn ClusterClient>,
    resource: ApiResource,
}

impl std::fmt::Debug for WidgetReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetReconciler")
            .field("resource", &self.resource.kind)
            .finish_non_exhaustive()
    }
}

impl WidgetReconciler {
    /// Creates a reconciler writing through `mirror`.
    pub fn new(mirror: Arc<dyn ClusterClient>) -> Self {
        Self {
            mirror,
            resource: resource_of::<Widget>(),
        }
    }
}

#[async_trait]
impl Reconciler for WidgetReconciler {
    type Error = ReconcileError;

    async fn reconcile(
        &self,
        ctx: &Context,
        request: &ReconcileRequest,
    ) -> Result<ReconcileResult, ReconcileError> {
        debug!(
            "Starting reconcile of Widget {} (clusterName: {})",
            request.key, request.cluster
        );

        let Some(object) = self.mirror.get(ctx, &self.resource, &request.key).await? else {
            debug!("Widget {} not found in mirror cluster, nothing to do", request.key);
            return Ok(ReconcileResult::done());
        };
        let widget: Widget = decode(&object)?;

        let generation = widget.metadata.generation;
        let observed = widget
            .status
            .as_ref()
            .and_then(|status| status.observed_generation);
        if generation.is_some() && generation != observed {
            let status = WidgetStatus {
                observed_generation: generation,
                last_reconciled: Some(chrono::Utc::now()),
            };
            self.mirror
                .patch_status(ctx, &self.resource, &request.key, &serde_json::to_value(&status)?)
                .await?;
            info!(
                "Updated Widget {} status: observedGeneration={}",
                request.key,
                generation.unwrap_or_default()
            );
        }

        debug!(
            "Completed reconcile of Widget {} (clusterName: {})",
            request.key, request.cluster
        );
        Ok(ReconcileResult::done())
    }
}
