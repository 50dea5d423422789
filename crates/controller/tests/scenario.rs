use std::sync::Arc;
use std::time::Duration;

use ixo_controller::{start, OperatorConfig};
use ixo_core::{IndexerClusterStatus, ObjectKey, Phase};
use ixo_kubehub::MemoryHub;
use serde_json::json;

fn replicas(hub: &MemoryHub, key: &ObjectKey) -> Option<i32> {
    hub.workload(key).and_then(|s| s.spec).and_then(|s| s.replicas)
}

fn phase(hub: &MemoryHub, key: &ObjectKey) -> Option<Phase> {
    IndexerClusterStatus::from_value(hub.cluster(key).and_then(|c| c.status).as_ref()).map(|s| s.phase)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn operator(hub: &Arc<MemoryHub>) -> ixo_controller::Operator {
    start(Arc::clone(hub), hub.cluster_events(), hub.workload_events(), &OperatorConfig::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_scale_and_restore_after_rogue_change() {
    let hub = Arc::new(MemoryHub::new());
    let op = operator(&hub);
    let key = hub.put_cluster("ns", "foo", json!({ "replicas": 3 }));
    let wkey = ObjectKey::new("ns", "foo-indexer");

    eventually("3 replicas", || replicas(&hub, &wkey) == Some(3)).await;
    eventually("ready", || phase(&hub, &key) == Some(Phase::Ready)).await;

    hub.put_cluster("ns", "foo", json!({ "replicas": 5 }));
    eventually("5 replicas", || replicas(&hub, &wkey) == Some(5)).await;

    // Rogue actor scales the child; the workload watch brings the owner back.
    hub.scale_workload(&wkey, 2);
    eventually("restored to 5", || replicas(&hub, &wkey) == Some(5)).await;

    let owner = hub.workload(&wkey).unwrap().metadata.owner_references.unwrap();
    assert_eq!(owner.len(), 1);
    assert_eq!(owner[0].controller, Some(true));
    assert_eq!(hub.stats().workload_creates, 1);
    op.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_is_left_to_garbage_collection() {
    let hub = Arc::new(MemoryHub::new());
    let op = operator(&hub);
    let key = hub.put_cluster("ns", "foo", json!({ "replicas": 1 }));
    eventually("ready", || phase(&hub, &key) == Some(Phase::Ready)).await;

    assert!(hub.delete_cluster(&key));
    assert_eq!(hub.workload_count(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.workload_count(), 0);
    assert_eq!(hub.stats().workload_creates, 1);
    op.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_spec_does_not_stall_other_clusters() {
    let hub = Arc::new(MemoryHub::new());
    let op = operator(&hub);
    let bad = hub.put_cluster("ns", "bad", json!({ "replicas": -2 }));
    let good = hub.put_cluster("other", "good", json!({ "replicas": 2 }));

    eventually("good ready", || phase(&hub, &good) == Some(Phase::Ready)).await;
    eventually("bad reported", || phase(&hub, &bad) == Some(Phase::Error)).await;
    assert!(hub.workload(&ObjectKey::new("ns", "bad-indexer")).is_none());

    // Correcting replicas lets it converge.
    hub.put_cluster("ns", "bad", json!({ "replicas": 1 }));
    eventually("bad fixed", || phase(&hub, &bad) == Some(Phase::Ready)).await;
    op.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waits_for_rollout_then_converges() {
    let hub = Arc::new(MemoryHub::new());
    hub.set_auto_ready(false);
    let cfg = OperatorConfig { progress_requeue: Duration::from_millis(50), ..OperatorConfig::default() };
    let op = start(Arc::clone(&hub), hub.cluster_events(), hub.workload_events(), &cfg);
    let key = hub.put_cluster("ns", "foo", json!({ "replicas": 2 }));
    let wkey = ObjectKey::new("ns", "foo-indexer");

    eventually("scaling up", || phase(&hub, &key) == Some(Phase::ScalingUp)).await;
    hub.mark_ready(&wkey);
    eventually("ready", || phase(&hub, &key) == Some(Phase::Ready)).await;
    assert_eq!(hub.stats().workload_creates, 1);
    op.shutdown(Duration::from_secs(1)).await;
}
