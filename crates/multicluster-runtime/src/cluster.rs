//! Capabilities a cluster connection provides to the manager.
//!
//! A registered cluster supplies a [`ClusterClient`] (reads and writes) and
//! a [`ClusterCache`] (watches). Both work on `DynamicObject`s described by
//! an `ApiResource`, so one implementation serves every kind.

use crate::context::Context;
use crate::error::{CacheError, ClientError};
use crate::types::{ObjectKey, WatchEvent};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Capacity of the channel behind each [`Subscription`].
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Read/write access to one cluster.
///
/// Implementations must be safe for concurrent use and must honor the
/// cluster carried by `ctx` as well as its cancellation.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object. `Ok(None)` if it does not exist.
    async fn get(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, ClientError>;

    /// List objects, in one namespace or across all of them.
    async fn list(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;

    /// Create or update an object with server-side apply.
    async fn apply(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Merge `status` into the object's status subresource.
    async fn patch_status(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(
        &self,
        ctx: &Context,
        resource: &ApiResource,
        key: &ObjectKey,
    ) -> Result<(), ClientError>;
}

/// Watch side of a cluster connection.
#[async_trait]
pub trait ClusterCache: Send + Sync {
    /// Subscribe to change events for `resource`. Must be called before
    /// [`ClusterCache::run`].
    fn subscribe(&self, resource: &ApiResource) -> Subscription;

    /// Verify the cluster is reachable. Called once before `run`.
    async fn connect(&self) -> Result<(), CacheError>;

    /// Run the watch loops until `ctx` is cancelled.
    async fn run(&self, ctx: Context) -> Result<(), CacheError>;
}

/// Receiving end of a cache subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<WatchEvent>,
}

impl Subscription {
    /// Next event, or `None` once the cache has dropped the subscription.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}

/// Subscriber registry shared by cache implementations.
///
/// Events are published outside the lock, so a slow subscriber never blocks
/// registration or other kinds.
#[derive(Debug, Default)]
pub struct Subscribers {
    by_kind: Mutex<HashMap<String, (ApiResource, Vec<mpsc::Sender<WatchEvent>>)>>,
}

impl Subscribers {
    /// Add a subscriber for `resource`.
    pub fn subscribe(&self, resource: &ApiResource) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut by_kind = self
            .by_kind
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        by_kind
            .entry(resource_key(resource))
            .or_insert_with(|| (resource.clone(), Vec::new()))
            .1
            .push(sender);
        Subscription { receiver }
    }

    /// Every resource with at least one subscriber.
    pub fn resources(&self) -> Vec<ApiResource> {
        self.by_kind
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    /// Deliver `event` to every subscriber of `resource`, dropping closed
    /// subscriptions.
    pub async fn publish(&self, resource: &ApiResource, event: WatchEvent) {
        let key = resource_key(resource);
        let senders = {
            let by_kind = self
                .by_kind
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match by_kind.get(&key) {
                Some((_, senders)) => senders.clone(),
                None => return,
            }
        };

        let mut closed = false;
        for sender in &senders {
            if sender.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            let mut by_kind = self
                .by_kind
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((_, senders)) = by_kind.get_mut(&key) {
                senders.retain(|sender| !sender.is_closed());
            }
        }
    }
}

fn resource_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.kind)
}

/// The `ApiResource` of a statically typed kind.
#[must_use]
pub fn resource_of<K>() -> ApiResource
where
    K: kube::Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

/// Fetch an object and decode it as `K`.
pub async fn get_as<K>(
    client: &dyn ClusterClient,
    ctx: &Context,
    key: &ObjectKey,
) -> Result<Option<K>, ClientError>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned,
{
    match client.get(ctx, &resource_of::<K>(), key).await? {
        Some(object) => Ok(Some(decode(&object)?)),
        None => Ok(None),
    }
}

/// Decode a dynamic object into a typed one.
pub fn decode<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, ClientError> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}
