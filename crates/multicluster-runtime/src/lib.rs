//! Multi-cluster reconcile runtime
//!
//! The substrate a controller plugs its reconciliation logic into when the
//! objects it watches and the objects it writes live in different clusters.
//!
//! # Components
//!
//! - **Logical cluster context** ([`context`]): attaches a tenant identity to
//!   the request context so identically-named objects in different logical
//!   clusters stay apart.
//! - **Work queue** ([`queue`], [`backoff`]): deduplicating, delay-capable
//!   queue of reconcile requests with per-key retry backoff.
//! - **Reconcile engine** ([`engine`], [`handler`]): a worker pool that pulls
//!   requests, calls a [`Reconciler`] and schedules the follow-up.
//! - **Multi-cluster manager** ([`manager`], [`cluster`]): owns the cluster
//!   connections, runs their caches and wires one cluster's watch events
//!   into an engine whose reconciler writes elsewhere.
//!
//! # Example
//!
//! ```no_run
//! use multicluster_runtime::{
//!     ClusterIdentity, Context, Engine, KubeCluster, KubeClusterOptions, Manager,
//!     ReconcileRequest, ReconcileResult, Reconciler,
//! };
//! use kube::api::{ApiResource, GroupVersionKind};
//! use std::sync::Arc;
//!
//! struct Noop;
//!
//! #[async_trait::async_trait]
//! impl Reconciler for Noop {
//!     type Error = std::convert::Infallible;
//!
//!     async fn reconcile(
//!         &self,
//!         _ctx: &Context,
//!         _request: &ReconcileRequest,
//!     ) -> Result<ReconcileResult, Self::Error> {
//!         Ok(ReconcileResult::done())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new();
//! let reference = ClusterIdentity::from("reference");
//! let cluster = KubeCluster::new(
//!     reference.clone(),
//!     kube::Config::infer().await?,
//!     KubeClusterOptions::default(),
//! )?;
//! manager.register(reference.clone(), cluster.client, cluster.cache)?;
//!
//! let engine = Engine::new("widget");
//! let widgets = ApiResource::from_gvk(&GroupVersionKind::gvk(
//!     "tutorial.kubebuilder.io",
//!     "v1alpha1",
//!     "Widget",
//! ));
//! manager.watch(&reference, &widgets, engine.enqueue_handler())?;
//!
//! let ctx = Context::background();
//! let (started, ()) = tokio::join!(
//!     manager.start(&ctx),
//!     engine.run(&ctx, Arc::new(Noop), 2),
//! );
//! started?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cluster;
pub mod context;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod handler;
pub mod kube_cluster;
pub mod manager;
pub mod queue;
pub mod reconciler;
pub mod types;

#[cfg(test)]
mod manager_test;

pub use backoff::{Backoff, ExponentialBackoff, FibonacciBackoff};
pub use cluster::{ClusterCache, ClusterClient, Subscription, decode, get_as, resource_of};
pub use context::{Context, LOGICAL_CLUSTER_ANNOTATION, cluster_from, logical_cluster_of, with_cluster};
pub use engine::Engine;
pub use error::{CacheError, ClientError, ManagerError};
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeCluster;
pub use handler::{EnqueueRequestForObject, EnqueueRequestsFromMapFn, EventHandler};
pub use kube_cluster::{KubeCache, KubeClient, KubeCluster, KubeClusterOptions};
pub use manager::{ClusterState, Manager, WatchHandle};
pub use queue::WorkQueue;
pub use reconciler::{ReconcileResult, Reconciler};
pub use types::{ClusterIdentity, EventType, ObjectKey, ReconcileRequest, WatchEvent};
