use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ixo_apply::{ApplyState, IndexerClusterApplier};
use ixo_controller::{IndexerClusterReconciler, ReconcileOptions, Reconciler};
use ixo_core::{ApplyError, ApplyOutcome, ClusterObject, ObjectKey, ReconcileResult};
use ixo_kubehub::{api_error, ClusterReader, MemoryHub};
use serde_json::json;
use tracing::Span;

/// Reader returning a fixed answer.
struct FixedReader(Result<Option<ClusterObject>, u16>);

#[async_trait]
impl ClusterReader for FixedReader {
    async fn get_cluster(&self, _key: &ObjectKey) -> Result<Option<ClusterObject>, kube::Error> {
        match &self.0 {
            Ok(c) => Ok(c.clone()),
            Err(code) => Err(api_error(*code, "InternalError", "boom")),
        }
    }
}

/// ApplyState returning a fixed answer and remembering what it saw.
struct ScriptedApply {
    answer: Result<ApplyOutcome, ApplyError>,
    calls: AtomicUsize,
    seen: Mutex<Option<ClusterObject>>,
}

impl ScriptedApply {
    fn new(answer: Result<ApplyOutcome, ApplyError>) -> Arc<Self> {
        Arc::new(Self { answer, calls: AtomicUsize::new(0), seen: Mutex::new(None) })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApplyState for ScriptedApply {
    async fn apply(&self, cluster: &ClusterObject) -> Result<ApplyOutcome, ApplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some(cluster.clone());
        self.answer.clone()
    }
}

fn bare_cluster() -> ClusterObject {
    ClusterObject {
        api_version: None,
        kind: Some(String::new()),
        key: ObjectKey::new("ns", "foo"),
        uid: Some("uid".into()),
        resource_version: Some("7".into()),
        generation: Some(1),
        spec: json!({ "replicas": 3 }),
        status: None,
    }
}

fn reconciler(
    read: Result<Option<ClusterObject>, u16>,
    apply: &Arc<ScriptedApply>,
    floor: Duration,
) -> IndexerClusterReconciler<FixedReader, ScriptedApply> {
    IndexerClusterReconciler::new(
        Arc::new(FixedReader(read)),
        Arc::clone(apply),
        ReconcileOptions { error_requeue_floor: floor },
        Span::none(),
    )
}

fn key() -> ObjectKey {
    ObjectKey::new("ns", "foo")
}

#[tokio::test]
async fn deleted_cluster_converges_without_apply() {
    let apply = ScriptedApply::new(Ok(ApplyOutcome::converged()));
    let r = reconciler(Ok(None), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::Converged);
    assert_eq!(apply.calls(), 0);
}

#[tokio::test]
async fn read_failure_requeues_with_backoff() {
    let apply = ScriptedApply::new(Ok(ApplyOutcome::converged()));
    let r = reconciler(Err(503), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueNow);
    assert_eq!(apply.calls(), 0);
}

#[tokio::test]
async fn type_meta_is_stamped_before_apply() {
    let apply = ScriptedApply::new(Ok(ApplyOutcome::converged()));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::Converged);
    let seen = apply.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.api_version.as_deref(), Some("ixo.dev/v1alpha1"));
    assert_eq!(seen.kind.as_deref(), Some("IndexerCluster"));
}

#[tokio::test]
async fn progress_requests_delayed_requeue() {
    let apply = ScriptedApply::new(Ok(ApplyOutcome::requeue_after(Duration::from_secs(5))));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueAfter(Duration::from_secs(5)));

    let apply = ScriptedApply::new(Ok(ApplyOutcome { requeue: true, requeue_after: Duration::ZERO }));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueNow);
}

#[tokio::test]
async fn transient_error_delay_is_floored() {
    let apply = ScriptedApply::new(Err(ApplyError::transient("flaky", Duration::ZERO)));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueAfter(Duration::from_secs(1)));

    let apply = ScriptedApply::new(Err(ApplyError::transient("flaky", Duration::from_secs(30))));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueAfter(Duration::from_secs(30)));
}

#[tokio::test]
async fn disabled_floor_falls_back_to_rate_limited_requeue() {
    let apply = ScriptedApply::new(Err(ApplyError::transient("flaky", Duration::ZERO)));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::ZERO);
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::RequeueNow);
}

#[tokio::test]
async fn invalid_spec_is_fatal() {
    let apply = ScriptedApply::new(Err(ApplyError::invalid_spec("replicas must be >= 0")));
    let r = reconciler(Ok(Some(bare_cluster())), &apply, Duration::from_secs(1));
    assert_eq!(r.reconcile(&key()).await, ReconcileResult::Fatal("replicas must be >= 0".into()));
}

#[tokio::test]
async fn reconcile_twice_is_idempotent() {
    let hub = Arc::new(MemoryHub::new());
    let key = hub.put_cluster("ns", "foo", json!({ "replicas": 3 }));
    let applier = Arc::new(IndexerClusterApplier::new(Arc::clone(&hub)));
    let r = IndexerClusterReconciler::new(Arc::clone(&hub), applier, ReconcileOptions::default(), Span::none());

    assert_eq!(r.reconcile(&key).await, ReconcileResult::Converged);
    assert_eq!(r.reconcile(&key).await, ReconcileResult::Converged);
    let stats = hub.stats();
    assert_eq!(stats.workload_creates, 1);
    assert_eq!(stats.workload_replaces, 0);
    assert_eq!(hub.workload_count(), 1);
}
