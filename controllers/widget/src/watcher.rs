//! Widget watch wiring.
//!
//! Widgets are watched in the reference cluster, where they are authored,
//! and in the mirror cluster, so drift in the mirror is corrected too.
//! Both feed the same engine; the reconciler decides what to write.

use crate::error::ControllerError;
use crds::Widget;
use multicluster_runtime::{ClusterIdentity, Engine, Manager, WatchHandle, resource_of};
use tracing::info;

/// Subscribe `engine` to Widget events of both clusters.
pub fn watch_widgets(
    manager: &Manager,
    engine: &Engine,
    reference: &ClusterIdentity,
    mirror: &ClusterIdentity,
) -> Result<Vec<WatchHandle>, ControllerError> {
    let widgets = resource_of::<Widget>();
    let mut handles = Vec::with_capacity(2);
    for source in [reference, mirror] {
        handles.push(manager.watch(source, &widgets, engine.enqueue_handler())?);
        info!("Watching Widgets in cluster {}", source);
    }
    Ok(handles)
}
