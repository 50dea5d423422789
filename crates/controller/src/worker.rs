//! Worker pool: `get → reconcile → route → done`, one key in flight per key.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use ixo_core::{ObjectKey, ReconcileResult};
use ixo_queue::WorkQueue;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::policy::{DefaultRequeuePolicy, RequeuePolicy};
use crate::Reconciler;

pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    policy: Arc<dyn RequeuePolicy>,
    workers: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { reconciler, queue, policy: Arc::new(DefaultRequeuePolicy), workers: 1 }
    }

    pub fn with_policy(mut self, policy: impl RequeuePolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Number of parallel workers; at least one.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Spawn the workers. Each exits once the queue is shut down.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        info!(controller = self.reconciler.name(), workers = self.workers, "starting workers");
        (0..self.workers)
            .map(|id| {
                let span = info_span!("worker", controller = self.reconciler.name(), id);
                tokio::spawn(
                    worker_loop(Arc::clone(&self.reconciler), Arc::clone(&self.queue), Arc::clone(&self.policy))
                        .instrument(span),
                )
            })
            .collect()
    }

    /// Run the workers until the queue shuts down.
    pub async fn run(self) {
        for handle in self.spawn() {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

async fn worker_loop<R: Reconciler>(reconciler: Arc<R>, queue: Arc<WorkQueue<ObjectKey>>, policy: Arc<dyn RequeuePolicy>) {
    let name = reconciler.name().to_string();
    while let Some(key) = queue.get().await {
        let t0 = Instant::now();
        let result = match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                counter!("reconcile_panics_total", 1u64, "controller" => name.clone());
                error!(key = %key, "reconcile panicked; retrying with backoff");
                ReconcileResult::RequeueNow
            }
        };
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => name.clone());
        counter!("reconcile_total", 1u64, "controller" => name.clone(), "result" => result.label());
        policy.route(&queue, &key, &result);
        queue.done(&key);
    }
    debug!("worker stopped");
}
