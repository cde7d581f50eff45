//! Event handlers turn watch events into reconcile requests.

use crate::queue::WorkQueue;
use crate::types::{ReconcileRequest, WatchEvent};
use std::fmt;
use tracing::trace;

/// Receives events from a subscription's dispatch task.
pub trait EventHandler: Send + Sync {
    /// Handle one event. Must not block.
    fn handle(&self, event: WatchEvent);
}

/// Enqueues a request for the object the event is about, attributed to the
/// cluster that produced the event.
#[derive(Clone)]
pub struct EnqueueRequestForObject {
    queue: WorkQueue<ReconcileRequest>,
}

impl EnqueueRequestForObject {
    /// Feed `queue`.
    #[must_use]
    pub fn new(queue: WorkQueue<ReconcileRequest>) -> Self {
        Self { queue }
    }
}

impl fmt::Debug for EnqueueRequestForObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequestForObject").finish_non_exhaustive()
    }
}

impl EventHandler for EnqueueRequestForObject {
    fn handle(&self, event: WatchEvent) {
        trace!(
            "Enqueue {:?} {} {} from {}",
            event.event_type, event.kind, event.key, event.cluster
        );
        self.queue
            .add(ReconcileRequest::new(event.cluster, event.key));
    }
}

/// Enqueues whatever requests a mapping function derives from the event.
///
/// Useful to re-attribute events to another cluster identity or to fan one
/// event out to several objects.
pub struct EnqueueRequestsFromMapFn<F> {
    queue: WorkQueue<ReconcileRequest>,
    map: F,
}

impl<F> EnqueueRequestsFromMapFn<F>
where
    F: Fn(&WatchEvent) -> Vec<ReconcileRequest> + Send + Sync,
{
    /// Feed `queue` with the output of `map`.
    pub fn new(queue: WorkQueue<ReconcileRequest>, map: F) -> Self {
        Self { queue, map }
    }
}

impl<F> fmt::Debug for EnqueueRequestsFromMapFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequestsFromMapFn").finish_non_exhaustive()
    }
}

impl<F> EventHandler for EnqueueRequestsFromMapFn<F>
where
    F: Fn(&WatchEvent) -> Vec<ReconcileRequest> + Send + Sync,
{
    fn handle(&self, event: WatchEvent) {
        for request in (self.map)(&event) {
            self.queue.add(request);
        }
    }
}
