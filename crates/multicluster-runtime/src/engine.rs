//! Reconcile engine.
//!
//! An [`Engine`] owns a work queue of [`ReconcileRequest`]s and runs a fixed
//! pool of workers against it. Each worker dequeues a request, attaches the
//! request's cluster to the context, calls the reconciler and then decides
//! how the key is scheduled next:
//!
//! | Outcome                          | Queue action                  |
//! |----------------------------------|-------------------------------|
//! | error (or panic)                 | `add_rate_limited`            |
//! | `requeue`                        | `add_rate_limited`            |
//! | `requeue_after > 0`              | `add_after`, then `forget`    |
//! | otherwise                        | `forget`                      |
//!
//! `done` is called exactly once per delivery, after classification.

use crate::context::Context;
use crate::handler::EnqueueRequestForObject;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileResult, Reconciler};
use crate::types::ReconcileRequest;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

/// Drives a [`Reconciler`] from a work queue.
#[derive(Debug, Clone)]
pub struct Engine {
    name: Arc<str>,
    queue: WorkQueue<ReconcileRequest>,
}

impl Engine {
    /// Create an engine with a default queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_queue(name, WorkQueue::new())
    }

    /// Create an engine around an existing queue.
    pub fn with_queue(name: impl Into<String>, queue: WorkQueue<ReconcileRequest>) -> Self {
        Self {
            name: Arc::from(name.into()),
            queue,
        }
    }

    /// Engine name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine's work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ReconcileRequest> {
        &self.queue
    }

    /// A handler that feeds watch events into this engine.
    #[must_use]
    pub fn enqueue_handler(&self) -> Arc<EnqueueRequestForObject> {
        Arc::new(EnqueueRequestForObject::new(self.queue.clone()))
    }

    /// Run `concurrency` workers until `ctx` is cancelled.
    ///
    /// Cancellation shuts the queue down; workers stop dequeuing but let
    /// in-flight reconciles finish. Returns once every worker has exited.
    pub async fn run<R: Reconciler>(&self, ctx: &Context, reconciler: Arc<R>, concurrency: usize) {
        let concurrency = concurrency.max(1);
        info!("Starting engine {} with {} workers", self.name, concurrency);

        let shutdown = {
            let ctx = ctx.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                queue.shut_down();
            })
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let engine = self.clone();
            let ctx = ctx.clone();
            let reconciler = Arc::clone(&reconciler);
            workers.spawn(async move { engine.worker(worker_id, &ctx, reconciler.as_ref()).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Engine {} worker exited abnormally: {}", self.name, e);
            }
        }
        shutdown.abort();

        info!("Engine {} stopped", self.name);
    }

    async fn worker<R: Reconciler>(&self, worker_id: usize, ctx: &Context, reconciler: &R) {
        debug!("Engine {} worker {} started", self.name, worker_id);
        while let Some(request) = self.queue.get().await {
            self.process(ctx, reconciler, request).await;
        }
        debug!("Engine {} worker {} exiting", self.name, worker_id);
    }

    async fn process<R: Reconciler>(&self, ctx: &Context, reconciler: &R, request: ReconcileRequest) {
        let span = info_span!(
            "reconcile",
            engine = %self.name,
            cluster = %request.cluster,
            object = %request.key,
        );
        let request_ctx = ctx.with_cluster(request.cluster.clone());
        let started = Instant::now();

        let outcome = AssertUnwindSafe(reconciler.reconcile(&request_ctx, &request))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(result)) => self.schedule(&request, result),
            Ok(Err(e)) => {
                error!(
                    "Reconciliation failed for {} after {:?}: {}",
                    request,
                    started.elapsed(),
                    e
                );
                self.queue.add_rate_limited(request.clone());
            }
            Err(panic) => {
                error!(
                    "Reconciler panicked for {}: {}",
                    request,
                    panic_message(panic.as_ref())
                );
                self.queue.add_rate_limited(request.clone());
            }
        }

        self.queue.done(&request);
    }

    fn schedule(&self, request: &ReconcileRequest, result: ReconcileResult) {
        if result.requeue {
            debug!("Requeue {} with backoff", request);
            self.queue.add_rate_limited(request.clone());
            return;
        }

        match result.requeue_after {
            Some(delay) if !delay.is_zero() => {
                debug!("Requeue {} after {:?}", request, delay);
                self.queue.add_after(request.clone(), delay);
                self.queue.forget(request);
            }
            _ => {
                debug!("Reconciled {}", request);
                self.queue.forget(request);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}
