//! Multi-cluster manager.
//!
//! The manager owns every cluster connection of the process. Each
//! registration binds a [`ClusterIdentity`] to a client and a cache; watches
//! subscribe an [`EventHandler`] to one cluster's cache while the reconciler
//! fed by that handler may write to a different cluster through
//! [`Manager::client_for`]. That split is what makes mirroring work: events
//! come from the reference cluster, writes go to the mirror.
//!
//! Lifecycle of every registration:
//!
//! ```text
//! Registered -> Starting -> Running -> Stopping -> Stopped
//!                  |                                  ^
//!                  +---------- connect failed --------+
//! ```
//!
//! A single cache failing to connect aborts the whole start: a controller
//! must not run against a partial multi-cluster view.

use crate::cluster::{ClusterCache, ClusterClient, Subscription};
use crate::context::Context;
use crate::error::{CacheError, ManagerError};
use crate::handler::EventHandler;
use crate::types::ClusterIdentity;
use futures::FutureExt;
use kube::api::ApiResource;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Registered, manager not started
    Registered,
    /// Cache is connecting
    Starting,
    /// Cache watch loops are running
    Running,
    /// Shutdown in progress
    Stopping,
    /// Cache stopped (after shutdown or a failure)
    Stopped,
}

struct Registration {
    client: Arc<dyn ClusterClient>,
    cache: Arc<dyn ClusterCache>,
    state: ClusterState,
}

/// Handle to a watch subscription. Cancelling it stops event dispatch.
#[derive(Debug, Clone, Default)]
pub struct WatchHandle {
    token: CancellationToken,
}

impl WatchHandle {
    /// Stop delivering events to the handler.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owns the registered clusters and runs their caches.
#[derive(Default)]
pub struct Manager {
    clusters: RwLock<BTreeMap<ClusterIdentity, Registration>>,
    watches: Mutex<Vec<WatchHandle>>,
    started: AtomicBool,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: BTreeMap<ClusterIdentity, ClusterState> = self
            .read_clusters()
            .iter()
            .map(|(identity, registration)| (identity.clone(), registration.state))
            .collect();
        f.debug_struct("Manager")
            .field("clusters", &states)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster connection under `identity`.
    pub fn register(
        &self,
        identity: ClusterIdentity,
        client: Arc<dyn ClusterClient>,
        cache: Arc<dyn ClusterCache>,
    ) -> Result<(), ManagerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let mut clusters = self.write_clusters();
        if clusters.contains_key(&identity) {
            return Err(ManagerError::AlreadyRegistered(identity));
        }
        info!("Registered cluster {}", identity);
        clusters.insert(
            identity,
            Registration {
                client,
                cache,
                state: ClusterState::Registered,
            },
        );
        Ok(())
    }

    /// The client of the cluster registered under `identity`.
    pub fn client_for(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<Arc<dyn ClusterClient>, ManagerError> {
        self.read_clusters()
            .get(identity)
            .map(|registration| Arc::clone(&registration.client))
            .ok_or_else(|| ManagerError::NotRegistered(identity.clone()))
    }

    /// Deliver `resource` events from the cache of `source` to `handler`.
    ///
    /// Events are handed over on a dedicated dispatch task, never from
    /// inside the cache. Must be called within a Tokio runtime and before
    /// [`Manager::start`].
    pub fn watch(
        &self,
        source: &ClusterIdentity,
        resource: &ApiResource,
        handler: Arc<dyn EventHandler>,
    ) -> Result<WatchHandle, ManagerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let cache = self
            .read_clusters()
            .get(source)
            .map(|registration| Arc::clone(&registration.cache))
            .ok_or_else(|| ManagerError::NotRegistered(source.clone()))?;

        let subscription = cache.subscribe(resource);
        let handle = WatchHandle::default();
        tokio::spawn(dispatch(subscription, handler, handle.token.clone()));

        info!("Watching {} in cluster {}", resource.kind, source);
        self.watches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle.clone());
        Ok(handle)
    }

    /// Current state of the cluster registered under `identity`.
    #[must_use]
    pub fn state(&self, identity: &ClusterIdentity) -> Option<ClusterState> {
        self.read_clusters()
            .get(identity)
            .map(|registration| registration.state)
    }

    /// Identities of every registered cluster.
    #[must_use]
    pub fn clusters(&self) -> Vec<ClusterIdentity> {
        self.read_clusters().keys().cloned().collect()
    }

    /// Returns `true` when at least one cluster is registered and every
    /// cluster is running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let clusters = self.read_clusters();
        !clusters.is_empty()
            && clusters
                .values()
                .all(|registration| registration.state == ClusterState::Running)
    }

    /// Start every cache and block until `ctx` is cancelled.
    ///
    /// Returns the first connect or watch failure after stopping every
    /// other cache; returns `Ok` after a clean shutdown.
    pub async fn start(&self, ctx: &Context) -> Result<(), ManagerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let caches: Vec<(ClusterIdentity, Arc<dyn ClusterCache>)> = self
            .read_clusters()
            .iter()
            .map(|(identity, registration)| (identity.clone(), Arc::clone(&registration.cache)))
            .collect();
        info!("Starting manager with {} clusters", caches.len());

        self.set_all_states(ClusterState::Starting);
        let connects = futures::future::try_join_all(caches.iter().map(|(identity, cache)| {
            async move {
                debug!("Connecting cache for cluster {}", identity);
                cache
                    .connect()
                    .await
                    .map_err(|source| ManagerError::CacheStart {
                        cluster: identity.clone(),
                        source,
                    })
            }
        }));

        tokio::select! {
            result = connects => {
                if let Err(e) = result {
                    error!("{}", e);
                    self.shutdown(ClusterState::Stopped);
                    return Err(e);
                }
            }
            () = ctx.cancelled() => {
                info!("Manager cancelled during startup");
                self.shutdown(ClusterState::Stopped);
                return Ok(());
            }
        }

        let run_ctx = ctx.child();
        let mut running = JoinSet::new();
        for (identity, cache) in caches {
            self.set_state(&identity, ClusterState::Running);
            let cache_ctx = run_ctx.clone();
            running.spawn(async move {
                let result = AssertUnwindSafe(cache.run(cache_ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(CacheError::Watch("cache panicked".to_string())));
                (identity, result)
            });
        }
        info!("All cluster caches running");

        let failure = tokio::select! {
            () = ctx.cancelled() => None,
            Some(joined) = running.join_next() => match joined {
                Ok((cluster, Ok(()))) if !run_ctx.is_cancelled() => Some(ManagerError::CacheFailed {
                    cluster,
                    source: CacheError::Watch("cache stopped unexpectedly".to_string()),
                }),
                Ok((cluster, Err(source))) => Some(ManagerError::CacheFailed { cluster, source }),
                Ok((_, Ok(()))) => None,
                Err(e) => {
                    error!("Cache task failed: {}", e);
                    None
                }
            },
        };

        info!("Stopping cluster caches");
        self.set_all_states(ClusterState::Stopping);
        run_ctx.cancel();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((cluster, Err(e))) => warn!("Cache for cluster {} stopped with error: {}", cluster, e),
                Ok((cluster, Ok(()))) => debug!("Cache for cluster {} stopped", cluster),
                Err(e) => error!("Cache task failed: {}", e),
            }
        }
        self.shutdown(ClusterState::Stopped);

        match failure {
            Some(e) => {
                error!("{}", e);
                Err(e)
            }
            None => {
                info!("Manager stopped");
                Ok(())
            }
        }
    }

    fn shutdown(&self, state: ClusterState) {
        self.set_all_states(state);
        for handle in self
            .watches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            handle.cancel();
        }
    }

    fn set_state(&self, identity: &ClusterIdentity, state: ClusterState) {
        if let Some(registration) = self.write_clusters().get_mut(identity) {
            registration.state = state;
        }
    }

    fn set_all_states(&self, state: ClusterState) {
        for registration in self.write_clusters().values_mut() {
            registration.state = state;
        }
    }

    fn read_clusters(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<ClusterIdentity, Registration>> {
        self.clusters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_clusters(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ClusterIdentity, Registration>> {
        self.clusters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn dispatch(
    mut subscription: Subscription,
    handler: Arc<dyn EventHandler>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => handler.handle(event),
                None => break,
            },
        }
    }
    debug!("Watch dispatch stopped");
}
