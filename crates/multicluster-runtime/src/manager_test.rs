//! Unit tests for the multi-cluster manager

#[cfg(test)]
mod tests {
    use crate::cluster::ClusterClient;
    use crate::context::{Context, LOGICAL_CLUSTER_ANNOTATION, cluster_from};
    use crate::engine::Engine;
    use crate::error::{ClientError, ManagerError};
    use crate::fake::{FakeCluster, Operation};
    use crate::handler::EventHandler;
    use crate::manager::{ClusterState, Manager};
    use crate::reconciler::{ReconcileResult, Reconciler};
    use crate::types::{ClusterIdentity, EventType, ObjectKey, ReconcileRequest, WatchEvent};
    use async_trait::async_trait;
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    fn widgets() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            "tutorial.kubebuilder.io",
            "v1alpha1",
            "Widget",
        ))
    }

    fn widget(namespace: &str, name: &str, foo: &str) -> DynamicObject {
        DynamicObject::new(name, &widgets())
            .within(namespace)
            .data(json!({ "spec": { "foo": foo } }))
    }

    fn tenant_widget(tenant: &str, namespace: &str, name: &str) -> DynamicObject {
        let mut object = widget(namespace, name, tenant);
        object.metadata.annotations = Some(
            [(LOGICAL_CLUSTER_ANNOTATION.to_string(), tenant.to_string())]
                .into_iter()
                .collect(),
        );
        object
    }

    fn register(manager: &Manager, fake: &Arc<FakeCluster>, name: &str) -> ClusterIdentity {
        let identity = ClusterIdentity::from(name);
        manager
            .register(identity.clone(), fake.clone(), fake.clone())
            .unwrap();
        identity
    }

    /// Collects every event handed to it.
    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<WatchEvent>>,
    }

    impl EventHandler for RecordingHandler {
        fn handle(&self, event: WatchEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Reads every request's object from a target cluster, like a mirroring
    /// reconciler would.
    struct TargetReconciler {
        manager: Arc<Manager>,
        target: ClusterIdentity,
        seen: Mutex<Vec<ReconcileRequest>>,
        contexts: Mutex<Vec<ClusterIdentity>>,
    }

    #[async_trait]
    impl Reconciler for TargetReconciler {
        type Error = ClientError;

        async fn reconcile(
            &self,
            ctx: &Context,
            request: &ReconcileRequest,
        ) -> Result<ReconcileResult, ClientError> {
            self.seen.lock().unwrap().push(request.clone());
            self.contexts.lock().unwrap().push(cluster_from(ctx));
            let client = self
                .manager
                .client_for(&self.target)
                .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            client.get(ctx, &widgets(), &request.key).await?;
            Ok(ReconcileResult::done())
        }
    }

    fn start(manager: &Arc<Manager>) -> (Context, JoinHandle<Result<(), ManagerError>>) {
        let ctx = Context::new(CancellationToken::new());
        let handle = tokio::spawn({
            let manager = Arc::clone(manager);
            let ctx = ctx.clone();
            async move { manager.start(&ctx).await }
        });
        (ctx, handle)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let manager = Manager::new();
        let fake = Arc::new(FakeCluster::new("reference"));
        register(&manager, &fake, "reference");

        let err = manager
            .register(ClusterIdentity::from("reference"), fake.clone(), fake.clone())
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRegistered(id) if id.as_str() == "reference"));
        assert_eq!(manager.clusters().len(), 1);
    }

    #[tokio::test]
    async fn test_client_for_unknown_cluster() {
        let manager = Manager::new();
        let result: Result<Arc<dyn ClusterClient>, ManagerError> =
            manager.client_for(&ClusterIdentity::from("missing"));
        assert!(matches!(result, Err(ManagerError::NotRegistered(id)) if id.as_str() == "missing"));

        let err = manager
            .watch(
                &ClusterIdentity::from("missing"),
                &widgets(),
                Arc::new(RecordingHandler::default()),
            )
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_registered_clusters_start_in_registered_state() {
        let manager = Manager::new();
        let reference = Arc::new(FakeCluster::new("reference"));
        let id = register(&manager, &reference, "reference");

        assert_eq!(manager.state(&id), Some(ClusterState::Registered));
        assert_eq!(manager.state(&ClusterIdentity::from("other")), None);
        assert!(!manager.is_ready());
        assert!(!Manager::new().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_aborts_start() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference"));
        let mirror = Arc::new(FakeCluster::new("mirror"));
        let reference_id = register(&manager, &reference, "reference");
        let mirror_id = register(&manager, &mirror, "mirror");
        mirror.fail_connect("connection refused");

        let handler = Arc::new(RecordingHandler::default());
        let watch = manager
            .watch(&reference_id, &widgets(), handler.clone())
            .unwrap();

        let (_ctx, handle) = start(&manager);
        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("start did not return")
            .unwrap()
            .unwrap_err();

        match err {
            ManagerError::CacheStart { cluster, source } => {
                assert_eq!(cluster, mirror_id);
                assert!(source.to_string().contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.state(&reference_id), Some(ClusterState::Stopped));
        assert_eq!(manager.state(&mirror_id), Some(ClusterState::Stopped));
        assert!(!reference.is_running());
        assert!(!mirror.is_running());
        assert!(watch.is_cancelled());
        assert!(handler.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_shutdown() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference"));
        let mirror = Arc::new(FakeCluster::new("mirror"));
        let reference_id = register(&manager, &reference, "reference");
        let mirror_id = register(&manager, &mirror, "mirror");

        let (ctx, handle) = start(&manager);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.is_ready());
        assert_eq!(manager.state(&reference_id), Some(ClusterState::Running));
        assert!(reference.is_running());
        assert!(mirror.is_running());

        let late = manager.watch(
            &reference_id,
            &widgets(),
            Arc::new(RecordingHandler::default()),
        );
        assert!(matches!(late, Err(ManagerError::AlreadyStarted)));
        let fake = Arc::new(FakeCluster::new("late"));
        let late = manager.register(ClusterIdentity::from("late"), fake.clone(), fake);
        assert!(matches!(late, Err(ManagerError::AlreadyStarted)));

        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(manager.state(&reference_id), Some(ClusterState::Stopped));
        assert_eq!(manager.state(&mirror_id), Some(ClusterState::Stopped));
        assert!(!reference.is_running());
        assert!(!mirror.is_running());
        assert!(!manager.is_ready());

        let again = manager.start(&Context::background()).await;
        assert!(matches!(again, Err(ManagerError::AlreadyStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_delivers_events_from_source_only() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference"));
        let mirror = Arc::new(FakeCluster::new("mirror"));
        let reference_id = register(&manager, &reference, "reference");
        register(&manager, &mirror, "mirror");

        let handler = Arc::new(RecordingHandler::default());
        manager
            .watch(&reference_id, &widgets(), handler.clone())
            .unwrap();

        let (ctx, handle) = start(&manager);
        tokio::time::sleep(Duration::from_millis(10)).await;

        reference.put(&widgets(), widget("n1", "w1", "a")).await;
        mirror.put(&widgets(), widget("n1", "w2", "a")).await;
        reference.put(&widgets(), widget("n1", "w1", "b")).await;
        reference
            .remove(&widgets(), &ObjectKey::namespaced("n1", "w1"))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = handler.events.lock().unwrap().clone();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::Added, EventType::Updated, EventType::Deleted]
        );
        assert!(events.iter().all(|e| e.cluster == reference_id));
        assert!(events.iter().all(|e| e.key.name == "w1"));

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_watch_stops_delivery() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference"));
        let reference_id = register(&manager, &reference, "reference");

        let handler = Arc::new(RecordingHandler::default());
        let watch = manager
            .watch(&reference_id, &widgets(), handler.clone())
            .unwrap();

        let (ctx, handle) = start(&manager);
        tokio::time::sleep(Duration::from_millis(10)).await;

        watch.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        reference.put(&widgets(), widget("n1", "w1", "a")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handler.events.lock().unwrap().is_empty());

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_writes_route_to_target_cluster() {
        let manager = Arc::new(Manager::new());
        let a = Arc::new(FakeCluster::new("a"));
        let b = Arc::new(FakeCluster::new("b"));
        let a_id = register(&manager, &a, "a");
        let b_id = register(&manager, &b, "b");

        let engine = Engine::new("routing");
        manager
            .watch(&a_id, &widgets(), engine.enqueue_handler())
            .unwrap();
        let reconciler = Arc::new(TargetReconciler {
            manager: Arc::clone(&manager),
            target: b_id.clone(),
            seen: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        });

        let (ctx, handle) = start(&manager);
        let engine_task = tokio::spawn({
            let engine = engine.clone();
            let ctx = ctx.clone();
            let reconciler = Arc::clone(&reconciler);
            async move { engine.run(&ctx, reconciler, 1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.put(&widgets(), widget("n1", "w1", "a")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(a.calls().is_empty(), "no client call may reach the source");
        let calls = b.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, Operation::Get);
        assert_eq!(calls[0].context_cluster, a_id);
        assert_eq!(calls[0].key, Some(ObjectKey::namespaced("n1", "w1")));

        ctx.cancel();
        handle.await.unwrap().unwrap();
        engine_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_object_is_reconciled_once() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference"));
        let mirror = Arc::new(FakeCluster::new("mirror"));
        let reference_id = register(&manager, &reference, "reference");
        let mirror_id = register(&manager, &mirror, "mirror");

        reference.put(&widgets(), widget("n1", "w1", "a")).await;
        mirror.put(&widgets(), widget("n1", "w1", "a")).await;

        let engine = Engine::new("mirror");
        manager
            .watch(&reference_id, &widgets(), engine.enqueue_handler())
            .unwrap();
        let reconciler = Arc::new(TargetReconciler {
            manager: Arc::clone(&manager),
            target: mirror_id,
            seen: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        });

        let (ctx, handle) = start(&manager);
        let engine_task = tokio::spawn({
            let engine = engine.clone();
            let ctx = ctx.clone();
            let reconciler = Arc::clone(&reconciler);
            async move { engine.run(&ctx, reconciler, 2).await }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;

        let seen = reconciler.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![ReconcileRequest::new(
                reference_id,
                ObjectKey::namespaced("n1", "w1")
            )]
        );
        assert!(engine.queue().is_empty());

        ctx.cancel();
        handle.await.unwrap().unwrap();
        engine_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_logical_clusters_reconcile_separately() {
        let manager = Arc::new(Manager::new());
        let reference = Arc::new(FakeCluster::new("reference").logical_cluster_aware());
        let mirror = Arc::new(FakeCluster::new("mirror"));
        let reference_id = register(&manager, &reference, "reference");
        let mirror_id = register(&manager, &mirror, "mirror");

        let engine = Engine::new("tenants");
        manager
            .watch(&reference_id, &widgets(), engine.enqueue_handler())
            .unwrap();
        let reconciler = Arc::new(TargetReconciler {
            manager: Arc::clone(&manager),
            target: mirror_id,
            seen: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        });

        let (ctx, handle) = start(&manager);
        let engine_task = tokio::spawn({
            let engine = engine.clone();
            let ctx = ctx.clone();
            let reconciler = Arc::clone(&reconciler);
            async move { engine.run(&ctx, reconciler, 2).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Same namespace and name in two logical clusters
        reference.put(&widgets(), tenant_widget("root:a", "n1", "w1")).await;
        reference.put(&widgets(), tenant_widget("root:b", "n1", "w1")).await;
        // Objects without the annotation stay with the cluster they came from
        reference.put(&widgets(), widget("n1", "w2", "plain")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let key = ObjectKey::namespaced("n1", "w1");
        let mut seen = reconciler.seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.cluster.cmp(&b.cluster).then(a.key.cmp(&b.key)));
        assert_eq!(
            seen,
            vec![
                ReconcileRequest::new("reference", ObjectKey::namespaced("n1", "w2")),
                ReconcileRequest::new("root:a", key.clone()),
                ReconcileRequest::new("root:b", key.clone()),
            ]
        );
        assert_ne!(seen[1], seen[2]);

        let mut contexts = reconciler.contexts.lock().unwrap().clone();
        contexts.sort();
        assert_eq!(
            contexts,
            vec![
                ClusterIdentity::from("reference"),
                ClusterIdentity::from("root:a"),
                ClusterIdentity::from("root:b"),
            ]
        );

        let mut mirror_clusters: Vec<ClusterIdentity> = mirror
            .calls()
            .into_iter()
            .map(|call| call.context_cluster)
            .collect();
        mirror_clusters.sort();
        assert_eq!(mirror_clusters, contexts);
        assert!(reference.calls().is_empty());

        ctx.cancel();
        handle.await.unwrap().unwrap();
        engine_task.await.unwrap();
    }
}
