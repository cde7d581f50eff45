//! Cluster connection backed by a Kubernetes API server.
//!
//! [`KubeClient`] and [`KubeCache`] implement the cluster capabilities with
//! kube-rs. When logical-cluster awareness is on (a kcp server or APIExport
//! virtual workspace), the client scopes every request to
//! `<server>/clusters/<identity>` using the identity carried by the context,
//! the cache lists and watches across every logical cluster through
//! `<server>/clusters/*`, and events are attributed to the `kcp.io/cluster`
//! annotation.

use crate::cluster::{ClusterCache, ClusterClient, Subscribers, Subscription};
use crate::context::{logical_cluster_of, Context};
use crate::error::{CacheError, ClientError};
use crate::types::{ClusterIdentity, EventType, ObjectKey, WatchEvent};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Field manager used when none is configured.
pub const DEFAULT_FIELD_MANAGER: &str = "multicluster-runtime";

/// Options shared by the client and cache of one cluster.
#[derive(Debug, Clone)]
pub struct KubeClusterOptions {
    /// Route requests by logical cluster and read the cluster annotation
    pub logical_cluster_aware: bool,
    /// Restrict watches to one namespace
    pub namespace: Option<String>,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl Default for KubeClusterOptions {
    fn default() -> Self {
        Self {
            logical_cluster_aware: false,
            namespace: None,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

/// Client and cache of one API server.
#[derive(Clone)]
pub struct KubeCluster {
    /// Read/write side
    pub client: Arc<KubeClient>,
    /// Watch side
    pub cache: Arc<KubeCache>,
}

impl KubeCluster {
    /// Connect to the API server described by `config`.
    ///
    /// No request is made until the cache connects or the client is used.
    pub fn new(
        identity: ClusterIdentity,
        config: kube::Config,
        options: KubeClusterOptions,
    ) -> Result<Self, ClientError> {
        let client = KubeClient::new(config, options.clone())?;
        let watch_client = if options.logical_cluster_aware {
            client.client_for_scope(&ClusterIdentity::wildcard())?
        } else {
            client.client.clone()
        };
        let cache = KubeCache::new(identity, watch_client, options);
        Ok(Self {
            client: Arc::new(client),
            cache: Arc::new(cache),
        })
    }
}

/// [`ClusterClient`] talking to a Kubernetes API server.
pub struct KubeClient {
    config: kube::Config,
    client: kube::Client,
    options: KubeClusterOptions,
    scoped: Mutex<HashMap<ClusterIdentity, kube::Client>>,
}

impl KubeClient {
    /// Build a client from `config`.
    pub fn new(config: kube::Config, options: KubeClusterOptions) -> Result<Self, ClientError> {
        let client = kube::Client::try_from(config.clone())?;
        Ok(Self {
            config,
            client,
            options,
            scoped: Mutex::new(HashMap::new()),
        })
    }

    /// Logical cluster requests made under `ctx` are scoped to.
    ///
    /// `None` when the connection is not logical-cluster aware. A context
    /// without a cluster is scoped to every logical cluster.
    fn scope(&self, ctx: &Context) -> Option<ClusterIdentity> {
        if !self.options.logical_cluster_aware {
            return None;
        }
        let cluster = ctx.cluster();
        Some(if cluster.is_none() {
            ClusterIdentity::wildcard()
        } else {
            cluster
        })
    }

    /// Client for the cluster carried by `ctx`.
    fn client_for(&self, ctx: &Context) -> Result<kube::Client, ClientError> {
        match self.scope(ctx) {
            Some(cluster) => self.client_for_scope(&cluster),
            None => Ok(self.client.clone()),
        }
    }

    fn client_for_scope(&self, cluster: &ClusterIdentity) -> Result<kube::Client, ClientError> {
        let mut scoped = self
            .scoped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = scoped.get(cluster) {
            return Ok(client.clone());
        }
        debug!("Creating client scoped to logical cluster {}", cluster);
        let client = kube::Client::try_from(scoped_config(&self.config, cluster)?)?;
        scoped.insert(cluster.clone(), client.clone());
        Ok(client)
    }

    fn api(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let client = self.client_for(ctx)?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(client, ns, resource),
            None => Api::all_with(client, resource),
        })
    }
}

/// Copy of `base` whose requests are scoped to a logical cluster.
pub fn scoped_config(
    base: &kube::Config,
    cluster: &ClusterIdentity,
) -> Result<kube::Config, ClientError> {
    let mut config = base.clone();
    let url = format!(
        "{}/clusters/{}",
        base.cluster_url.to_string().trim_end_matches('/'),
        cluster.as_str()
    );
    config.cluster_url = url
        .parse()
        .map_err(|e| ClientError::InvalidConfig(format!("invalid cluster URL {url}: {e}")))?;
    Ok(config)
}

/// Returns `true` for a 404 from the API server.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

async fn cancellable<T>(
    ctx: &Context,
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T, ClientError> {
    tokio::select! {
        () = ctx.cancelled() => Err(ClientError::Cancelled),
        result = call => result.map_err(ClientError::from),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let api = self.api(ctx, resource, key.namespace.as_deref())?;
        cancellable(ctx, api.get_opt(&key.name)).await
    }

    async fn list(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let api = self.api(ctx, resource, namespace)?;
        let list = cancellable(ctx, api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    async fn apply(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_resource(object);
        if key.name.is_empty() {
            return Err(ClientError::InvalidRequest(format!(
                "{} has no name",
                resource.kind
            )));
        }
        let api = self.api(ctx, resource, key.namespace.as_deref())?;
        let params = PatchParams::apply(&self.options.field_manager).force();
        cancellable(ctx, api.patch(&key.name, &params, &Patch::Apply(object))).await
    }

    async fn patch_status(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError> {
        let api = self.api(ctx, resource, key.namespace.as_deref())?;
        let patch = serde_json::json!({ "status": status });
        cancellable(
            ctx,
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn delete(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<(), ClientError> {
        let api = self.api(ctx, resource, key.namespace.as_deref())?;
        match cancellable(ctx, api.delete(&key.name, &DeleteParams::default())).await {
            Ok(_) => Ok(()),
            Err(ClientError::Kube(e)) if is_not_found(&e) => {
                debug!("{} {} already deleted", resource.kind, key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

type Entry = (ClusterIdentity, ObjectKey);

/// Objects a watcher has reported, used to classify its events.
///
/// A watcher restart re-lists everything; objects known before the re-list
/// but missing from it were deleted while the watch was down.
#[derive(Debug, Default)]
struct KnownObjects {
    known: HashSet<Entry>,
    relist: Option<HashSet<Entry>>,
}

impl KnownObjects {
    fn begin_relist(&mut self) {
        self.relist = Some(HashSet::new());
    }

    fn apply(&mut self, entry: &Entry) -> EventType {
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(entry.clone());
        }
        if self.known.insert(entry.clone()) {
            EventType::Added
        } else {
            EventType::Updated
        }
    }

    /// Ends a re-list, returning the objects that did not come back.
    fn finish_relist(&mut self) -> Vec<Entry> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let gone: Vec<Entry> = self.known.difference(&seen).cloned().collect();
        for entry in &gone {
            self.known.remove(entry);
        }
        gone
    }

    fn delete(&mut self, entry: &Entry) {
        self.known.remove(entry);
    }

    fn len(&self) -> usize {
        self.known.len()
    }
}

/// [`ClusterCache`] running one kube-runtime watcher per subscribed kind.
pub struct KubeCache {
    identity: ClusterIdentity,
    client: kube::Client,
    options: KubeClusterOptions,
    subscribers: Subscribers,
}

impl KubeCache {
    /// Create a cache whose events are attributed to `identity`.
    #[must_use]
    pub fn new(identity: ClusterIdentity, client: kube::Client, options: KubeClusterOptions) -> Self {
        Self {
            identity,
            client,
            options,
            subscribers: Subscribers::default(),
        }
    }

    fn event_cluster(&self, object: &DynamicObject) -> ClusterIdentity {
        if self.options.logical_cluster_aware {
            if let Some(cluster) = logical_cluster_of(object) {
                return cluster;
            }
        }
        self.identity.clone()
    }

    async fn publish(
        &self,
        resource: &ApiResource,
        cluster: ClusterIdentity,
        key: ObjectKey,
        event_type: EventType,
    ) {
        let event = WatchEvent {
            cluster,
            kind: resource.kind.clone(),
            key,
            event_type,
        };
        self.subscribers.publish(resource, event).await;
    }

    fn api(&self, resource: &ApiResource) -> Api<DynamicObject> {
        match &self.options.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn watch_resource(&self, ctx: &Context, resource: &ApiResource) -> Result<(), CacheError> {
        info!("Starting {} watcher for cluster {}", resource.kind, self.identity);

        let mut stream =
            pin!(watcher(self.api(resource), watcher::Config::default()).default_backoff());
        let mut known = KnownObjects::default();

        loop {
            let next = tokio::select! {
                () = ctx.cancelled() => {
                    debug!("{} watcher for cluster {} stopped", resource.kind, self.identity);
                    return Ok(());
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    // default_backoff delays the next attempt
                    warn!("{} watch error in cluster {}: {}", resource.kind, self.identity, e);
                    continue;
                }
                None => {
                    return Err(CacheError::Watch(format!(
                        "{} watch stream for cluster {} ended",
                        resource.kind, self.identity
                    )));
                }
            };

            match event {
                watcher::Event::Init => {
                    debug!("{} watcher for cluster {} listing", resource.kind, self.identity);
                    known.begin_relist();
                }
                watcher::Event::InitApply(object) | watcher::Event::Apply(object) => {
                    let entry = (self.event_cluster(&object), ObjectKey::from_resource(&object));
                    let event_type = known.apply(&entry);
                    self.publish(resource, entry.0, entry.1, event_type).await;
                }
                watcher::Event::InitDone => {
                    for (cluster, key) in known.finish_relist() {
                        self.publish(resource, cluster, key, EventType::Deleted).await;
                    }
                    info!(
                        "{} watcher for cluster {} synced ({} objects)",
                        resource.kind,
                        self.identity,
                        known.len()
                    );
                }
                watcher::Event::Delete(object) => {
                    let entry = (self.event_cluster(&object), ObjectKey::from_resource(&object));
                    known.delete(&entry);
                    self.publish(resource, entry.0, entry.1, EventType::Deleted).await;
                }
            }
        }
    }
}

#[async_trait]
impl ClusterCache for KubeCache {
    fn subscribe(&self, resource: &ApiResource) -> Subscription {
        self.subscribers.subscribe(resource)
    }

    async fn connect(&self) -> Result<(), CacheError> {
        let resources = self.subscribers.resources();
        if resources.is_empty() {
            let version = self
                .client
                .apiserver_version()
                .await
                .map_err(|e| CacheError::Connect(e.to_string()))?;
            info!(
                "Connected to cluster {} (Kubernetes {}.{})",
                self.identity, version.major, version.minor
            );
            return Ok(());
        }

        // Every watched kind must be listable where the watcher will look
        for resource in &resources {
            self.api(resource)
                .list_metadata(&ListParams::default().limit(1))
                .await
                .map_err(|e| {
                    CacheError::Connect(format!("cannot list {}: {e}", resource.kind))
                })?;
        }
        info!(
            "Connected to cluster {} ({} watched kinds)",
            self.identity,
            resources.len()
        );
        Ok(())
    }

    async fn run(&self, ctx: Context) -> Result<(), CacheError> {
        let resources = self.subscribers.resources();
        if resources.is_empty() {
            debug!("No watches registered for cluster {}", self.identity);
            ctx.cancelled().await;
            return Ok(());
        }

        futures::future::try_join_all(
            resources
                .iter()
                .map(|resource| self.watch_resource(&ctx, resource)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::GroupVersionKind;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn widgets() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            "tutorial.kubebuilder.io",
            "v1alpha1",
            "Widget",
        ))
    }

    fn entry(cluster: &str, name: &str) -> Entry {
        (ClusterIdentity::from(cluster), ObjectKey::namespaced("n1", name))
    }

    /// A cluster whose server is a bare listener at `path`.
    async fn listening_cluster(path: &str, logical_cluster_aware: bool) -> (KubeCluster, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}{}", listener.local_addr().unwrap(), path);
        let options = KubeClusterOptions {
            logical_cluster_aware,
            ..Default::default()
        };
        let cluster = KubeCluster::new(
            ClusterIdentity::from("reference"),
            kube::Config::new(url.parse().unwrap()),
            options,
        )
        .unwrap();
        (cluster, listener)
    }

    /// Request line of the first request made to `listener`.
    ///
    /// The connection is dropped without a response.
    async fn first_request_line(listener: TcpListener) -> String {
        let accept = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(2).any(|w| w == b"\r\n") {
                    break;
                }
            }
            String::from_utf8_lossy(&buf[..read])
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        };
        tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .expect("no request arrived")
    }

    #[test]
    fn test_known_objects_relist_reports_missing_objects() {
        let mut known = KnownObjects::default();
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Added);
        assert_eq!(known.apply(&entry("root:a", "w2")), EventType::Added);

        // The watch restarts and only w1 comes back
        known.begin_relist();
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Updated);
        assert_eq!(known.finish_relist(), vec![entry("root:a", "w2")]);
        assert_eq!(known.len(), 1);

        // A later re-creation counts as new
        assert_eq!(known.apply(&entry("root:a", "w2")), EventType::Added);
    }

    #[test]
    fn test_known_objects_relist_keeps_listed_objects() {
        let mut known = KnownObjects::default();
        known.begin_relist();
        known.apply(&entry("root:a", "w1"));
        assert!(known.finish_relist().is_empty());

        known.begin_relist();
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Updated);
        assert!(known.finish_relist().is_empty());
        assert_eq!(known.len(), 1);

        // No re-list in progress
        assert!(known.finish_relist().is_empty());
    }

    #[test]
    fn test_known_objects_apply_and_delete() {
        let mut known = KnownObjects::default();
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Added);
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Updated);
        // Same name in another logical cluster is a different object
        assert_eq!(known.apply(&entry("root:b", "w1")), EventType::Added);

        known.delete(&entry("root:a", "w1"));
        assert_eq!(known.len(), 1);
        assert_eq!(known.apply(&entry("root:a", "w1")), EventType::Added);
    }

    #[tokio::test]
    async fn test_logical_cluster_cache_watches_every_cluster() {
        let (cluster, listener) =
            listening_cluster("/services/apiexport/root/widgets", true).await;
        let _subscription = cluster.cache.subscribe(&widgets());

        let ctx = Context::new(CancellationToken::new());
        let run = tokio::spawn({
            let cache = Arc::clone(&cluster.cache);
            let ctx = ctx.clone();
            async move { cache.run(ctx).await }
        });

        let line = first_request_line(listener).await;
        assert!(
            line.starts_with(
                "GET /services/apiexport/root/widgets/clusters/*/apis/tutorial.kubebuilder.io/v1alpha1/widgets?"
            ),
            "unexpected request: {line}"
        );

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_logical_cluster_client_scopes_to_context_cluster() {
        let (cluster, listener) =
            listening_cluster("/services/apiexport/root/widgets", true).await;

        let call = tokio::spawn({
            let client = Arc::clone(&cluster.client);
            async move {
                let ctx = Context::background().with_cluster(ClusterIdentity::from("root:org:a"));
                client
                    .get(&ctx, &widgets(), &ObjectKey::namespaced("n1", "w1"))
                    .await
            }
        });

        let line = first_request_line(listener).await;
        assert!(
            line.starts_with(
                "GET /services/apiexport/root/widgets/clusters/root:org:a/apis/tutorial.kubebuilder.io/v1alpha1/namespaces/n1/widgets/w1 "
            ),
            "unexpected request: {line}"
        );
        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_logical_cluster_client_without_cluster_uses_wildcard() {
        let (cluster, listener) = listening_cluster("", true).await;

        let call = tokio::spawn({
            let client = Arc::clone(&cluster.client);
            async move { client.list(&Context::background(), &widgets(), None).await }
        });

        let line = first_request_line(listener).await;
        assert!(
            line.starts_with("GET /clusters/*/apis/tutorial.kubebuilder.io/v1alpha1/widgets"),
            "unexpected request: {line}"
        );
        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_plain_cluster_requests_are_unscoped() {
        let (cluster, listener) = listening_cluster("", false).await;

        let call = tokio::spawn({
            let client = Arc::clone(&cluster.client);
            async move {
                let ctx = Context::background().with_cluster(ClusterIdentity::from("reference"));
                client
                    .get(&ctx, &widgets(), &ObjectKey::namespaced("n1", "w1"))
                    .await
            }
        });

        let line = first_request_line(listener).await;
        assert!(
            line.starts_with("GET /apis/tutorial.kubebuilder.io/v1alpha1/namespaces/n1/widgets/w1 "),
            "unexpected request: {line}"
        );
        assert!(call.await.unwrap().is_err());
    }

    #[test]
    fn test_scoped_config_appends_logical_cluster() {
        let base = kube::Config::new("https://kcp.example.com:6443/".parse().unwrap());
        let scoped = scoped_config(&base, &ClusterIdentity::from("root:org:ws")).unwrap();
        assert_eq!(
            scoped.cluster_url.to_string(),
            "https://kcp.example.com:6443/clusters/root:org:ws"
        );
        // Base config is left alone
        assert_eq!(base.cluster_url.to_string(), "https://kcp.example.com:6443/");
    }

    #[test]
    fn test_scoped_config_keeps_existing_path() {
        let base = kube::Config::new(
            "https://kcp.example.com/services/apiexport/root/widgets"
                .parse()
                .unwrap(),
        );
        let scoped = scoped_config(&base, &ClusterIdentity::from("abc")).unwrap();
        assert_eq!(
            scoped.cluster_url.to_string(),
            "https://kcp.example.com/services/apiexport/root/widgets/clusters/abc"
        );
    }

    #[test]
    fn test_default_options_are_cluster_unaware() {
        let options = KubeClusterOptions::default();
        assert!(!options.logical_cluster_aware);
        assert_eq!(options.field_manager, DEFAULT_FIELD_MANAGER);
    }
}
