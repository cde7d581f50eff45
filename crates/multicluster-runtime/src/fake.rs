//! In-memory cluster for unit testing
//!
//! [`FakeCluster`] implements both [`ClusterClient`] and [`ClusterCache`]
//! without a running API server. It records every client call together
//! with the cluster carried by the call's context, so tests can assert
//! where a reconciler's reads and writes went.

use crate::cluster::{ClusterCache, ClusterClient, Subscribers, Subscription};
use crate::context::{logical_cluster_of, Context};
use crate::error::{CacheError, ClientError};
use crate::types::{ClusterIdentity, EventType, ObjectKey, WatchEvent};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Client operation recorded by a [`FakeCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `ClusterClient::get`
    Get,
    /// `ClusterClient::list`
    List,
    /// `ClusterClient::apply`
    Apply,
    /// `ClusterClient::patch_status`
    PatchStatus,
    /// `ClusterClient::delete`
    Delete,
}

/// One client call observed by a [`FakeCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// What was called
    pub operation: Operation,
    /// Cluster carried by the call's context
    pub context_cluster: ClusterIdentity,
    /// Kind of the resource
    pub kind: String,
    /// Target object, `None` for list calls
    pub key: Option<ObjectKey>,
}

type StoreKey = (String, ObjectKey);

/// In-memory cluster.
#[derive(Debug)]
pub struct FakeCluster {
    identity: ClusterIdentity,
    logical_cluster_aware: bool,
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    subscribers: Subscribers,
    calls: Mutex<Vec<RecordedCall>>,
    connect_error: Mutex<Option<String>>,
    running: AtomicBool,
    resource_version: Mutex<u64>,
}

impl FakeCluster {
    /// Create an empty cluster whose events are attributed to `identity`.
    pub fn new(identity: impl Into<ClusterIdentity>) -> Self {
        Self {
            identity: identity.into(),
            logical_cluster_aware: false,
            objects: Mutex::new(BTreeMap::new()),
            subscribers: Subscribers::default(),
            calls: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            running: AtomicBool::new(false),
            resource_version: Mutex::new(0),
        }
    }

    /// Attribute events to the `kcp.io/cluster` annotation when present.
    #[must_use]
    pub fn logical_cluster_aware(mut self) -> Self {
        self.logical_cluster_aware = true;
        self
    }

    /// Make `connect` fail with `message`.
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.connect_error.lock().unwrap() = Some(message.into());
    }

    /// Returns `true` while the cache's `run` loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Every client call so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Stored object, without recording a call.
    pub fn object(&self, resource: &ApiResource, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&store_key(resource, key))
            .cloned()
    }

    /// Create or replace an object as if another actor wrote it.
    ///
    /// Emits an event when the cache is running.
    pub async fn put(&self, resource: &ApiResource, object: DynamicObject) {
        self.store(resource, object).await;
    }

    /// Remove an object as if another actor deleted it.
    pub async fn remove(&self, resource: &ApiResource, key: &ObjectKey) {
        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&store_key(resource, key));
        if let Some(object) = removed {
            self.notify(resource, &object, EventType::Deleted).await;
        }
    }

    fn record(&self, operation: Operation, ctx: &Context, resource: &ApiResource, key: Option<&ObjectKey>) {
        self.calls.lock().unwrap().push(RecordedCall {
            operation,
            context_cluster: ctx.cluster(),
            kind: resource.kind.clone(),
            key: key.cloned(),
        });
    }

    fn next_resource_version(&self) -> String {
        let mut version = self.resource_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    async fn store(&self, resource: &ApiResource, mut object: DynamicObject) -> DynamicObject {
        let key = ObjectKey::from_resource(&object);
        object.metadata.resource_version = Some(self.next_resource_version());

        let existed = {
            let mut objects = self.objects.lock().unwrap();
            let existing = objects.get(&store_key(resource, &key));
            let generation = match existing {
                None => 1,
                Some(old) if old.data.get("spec") != object.data.get("spec") => {
                    old.metadata.generation.unwrap_or(0) + 1
                }
                Some(old) => old.metadata.generation.unwrap_or(1),
            };
            object.metadata.generation = Some(generation);
            if object.data.get("status").is_none() {
                if let Some(status) = existing.and_then(|old| old.data.get("status")).cloned() {
                    object.data["status"] = status;
                }
            }
            objects
                .insert(store_key(resource, &key), object.clone())
                .is_some()
        };

        let event_type = if existed {
            EventType::Updated
        } else {
            EventType::Added
        };
        self.notify(resource, &object, event_type).await;
        object
    }

    async fn notify(&self, resource: &ApiResource, object: &DynamicObject, event_type: EventType) {
        if !self.is_running() {
            return;
        }
        let event = WatchEvent {
            cluster: self.event_cluster(object),
            kind: resource.kind.clone(),
            key: ObjectKey::from_resource(object),
            event_type,
        };
        self.subscribers.publish(resource, event).await;
    }

    fn event_cluster(&self, object: &DynamicObject) -> ClusterIdentity {
        if self.logical_cluster_aware {
            if let Some(cluster) = logical_cluster_of(object) {
                return cluster;
            }
        }
        self.identity.clone()
    }
}

fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
    (format!("{}/{}", resource.api_version, resource.kind), key.clone())
}

fn check(ctx: &Context) -> Result<(), ClientError> {
    if ctx.is_cancelled() {
        return Err(ClientError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError> {
        self.record(Operation::Get, ctx, resource, Some(key));
        check(ctx)?;
        Ok(self.object(resource, key))
    }

    async fn list(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        self.record(Operation::List, ctx, resource, None);
        check(ctx)?;
        let kind = format!("{}/{}", resource.api_version, resource.kind);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, key), _)| {
                *k == kind && namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn apply(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_resource(object);
        self.record(Operation::Apply, ctx, resource, Some(&key));
        check(ctx)?;
        if key.name.is_empty() {
            return Err(ClientError::InvalidRequest("object has no name".to_string()));
        }
        Ok(self.store(resource, object.clone()).await)
    }

    async fn patch_status(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError> {
        self.record(Operation::PatchStatus, ctx, resource, Some(key));
        check(ctx)?;

        let mut object = self
            .object(resource, key)
            .ok_or_else(|| ClientError::InvalidRequest(format!("{} {} not found", resource.kind, key)))?;
        match (object.data.get_mut("status"), status) {
            (Some(serde_json::Value::Object(current)), serde_json::Value::Object(patch)) => {
                for (field, value) in patch {
                    current.insert(field.clone(), value.clone());
                }
            }
            _ => object.data["status"] = status.clone(),
        }
        Ok(self.store(resource, object).await)
    }

    async fn delete(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<(), ClientError> {
        self.record(Operation::Delete, ctx, resource, Some(key));
        check(ctx)?;
        self.remove(resource, key).await;
        Ok(())
    }
}

#[async_trait]
impl ClusterCache for FakeCluster {
    fn subscribe(&self, resource: &ApiResource) -> Subscription {
        self.subscribers.subscribe(resource)
    }

    async fn connect(&self) -> Result<(), CacheError> {
        match self.connect_error.lock().unwrap().clone() {
            Some(message) => Err(CacheError::Connect(message)),
            None => Ok(()),
        }
    }

    async fn run(&self, ctx: Context) -> Result<(), CacheError> {
        self.running.store(true, Ordering::SeqCst);

        // Initial list, like an informer's first sync
        for resource in self.subscribers.resources() {
            let kind = format!("{}/{}", resource.api_version, resource.kind);
            let existing: Vec<DynamicObject> = self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, object)| object.clone())
                .collect();
            for object in existing {
                self.notify(&resource, &object, EventType::Added).await;
            }
        }

        ctx.cancelled().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
