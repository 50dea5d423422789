//! Routing of reconcile outcomes back into the work queue.

use ixo_core::{ObjectKey, ReconcileResult};
use ixo_queue::WorkQueue;
use tracing::{debug, error};

/// Maps a pass outcome to queue actions. Called before `done(key)`.
pub trait RequeuePolicy: Send + Sync + 'static {
    fn route(&self, queue: &WorkQueue<ObjectKey>, key: &ObjectKey, result: &ReconcileResult);
}

/// Thin router:
///
/// | outcome | action |
/// |---|---|
/// | converged | `forget` |
/// | requeue now | rate-limited add (per-key exponential backoff) |
/// | requeue after `d` | `forget`, then add after `d` |
/// | fatal | log, `forget`, no add |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRequeuePolicy;

impl RequeuePolicy for DefaultRequeuePolicy {
    fn route(&self, queue: &WorkQueue<ObjectKey>, key: &ObjectKey, result: &ReconcileResult) {
        match result {
            ReconcileResult::Converged => queue.forget(key),
            ReconcileResult::RequeueNow => {
                debug!(key = %key, retries = queue.num_requeues(key), "requeue with backoff");
                queue.add_rate_limited(key.clone());
            }
            ReconcileResult::RequeueAfter(d) => {
                queue.forget(key);
                queue.add_after(key.clone(), *d);
            }
            ReconcileResult::Fatal(reason) => {
                error!(key = %key, reason = %reason, "reconcile failed permanently; not requeued");
                queue.forget(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixo_queue::Backoff;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn routes_each_outcome() {
        let q = WorkQueue::new("policy", Backoff::default());
        let key = ObjectKey::new("ns", "foo");
        let p = DefaultRequeuePolicy;

        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);
        p.route(&q, &key, &ReconcileResult::Converged);
        assert_eq!(q.num_requeues(&key), 0);

        p.route(&q, &key, &ReconcileResult::RequeueNow);
        assert_eq!(q.num_requeues(&key), 1);
        p.route(&q, &key, &ReconcileResult::Fatal("bad".into()));
        assert_eq!(q.num_requeues(&key), 0);

        // Drain what the rate-limited adds scheduled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.get().await, Some(key.clone()));
        q.done(&key);
        assert!(q.is_empty());

        p.route(&q, &key, &ReconcileResult::RequeueAfter(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }
}
