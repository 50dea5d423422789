//! IndexerCluster status derived from the live StatefulSet.

use chrono::{SecondsFormat, Utc};
use ixo_core::{ClusterObject, IndexerClusterSpec, IndexerClusterStatus, Phase};
use k8s_openapi::api::apps::v1::StatefulSet;

use crate::workload::selector_string;

pub fn derive_phase(desired: i32, live: &StatefulSet) -> Phase {
    let Some(st) = live.status.as_ref() else { return Phase::Pending };
    let observed = st.observed_generation.unwrap_or(0) >= live.metadata.generation.unwrap_or(0);
    let ready = st.ready_replicas.unwrap_or(0);
    let updated = st.updated_replicas.unwrap_or(0);
    if !observed {
        return Phase::Updating;
    }
    if st.replicas == desired && ready == desired && updated == desired {
        return Phase::Ready;
    }
    match st.replicas.cmp(&desired) {
        std::cmp::Ordering::Less => Phase::ScalingUp,
        std::cmp::Ordering::Greater => Phase::ScalingDown,
        std::cmp::Ordering::Equal => Phase::Updating,
    }
}

pub fn derive_status(spec: &IndexerClusterSpec, cluster: &ClusterObject, live: &StatefulSet) -> IndexerClusterStatus {
    let st = live.status.as_ref();
    IndexerClusterStatus {
        phase: derive_phase(spec.replicas, live),
        replicas: st.map_or(0, |s| s.replicas),
        ready_replicas: st.and_then(|s| s.ready_replicas).unwrap_or(0),
        selector: selector_string(&cluster.key.name),
        message: None,
        observed_generation: cluster.generation,
        last_transition_time: None,
    }
}

/// Status reported when the cluster's spec cannot be applied. Pod counts carry over from `prev`.
pub fn error_status(cluster: &ClusterObject, prev: Option<&IndexerClusterStatus>, message: &str) -> IndexerClusterStatus {
    IndexerClusterStatus {
        phase: Phase::Error,
        replicas: prev.map_or(0, |p| p.replicas),
        ready_replicas: prev.map_or(0, |p| p.ready_replicas),
        selector: selector_string(&cluster.key.name),
        message: Some(message.to_string()),
        observed_generation: cluster.generation,
        last_transition_time: None,
    }
}

/// The status to write, or `None` when `prev` already says the same thing.
/// The transition time moves only when the phase does.
pub fn next_status(prev: Option<&IndexerClusterStatus>, mut next: IndexerClusterStatus) -> Option<IndexerClusterStatus> {
    match prev {
        Some(p) if p.same_as(&next) => None,
        Some(p) if p.phase == next.phase && p.last_transition_time.is_some() => {
            next.last_transition_time = p.last_transition_time.clone();
            Some(next)
        }
        _ => {
            next.last_transition_time = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use ixo_core::ObjectKey;

    fn live(generation: i64, status: Option<StatefulSetStatus>) -> StatefulSet {
        let mut sts = StatefulSet::default();
        sts.metadata.generation = Some(generation);
        sts.status = status;
        sts
    }

    fn counts(observed: i64, replicas: i32, ready: i32, updated: i32) -> Option<StatefulSetStatus> {
        Some(StatefulSetStatus {
            observed_generation: Some(observed),
            replicas,
            ready_replicas: Some(ready),
            updated_replicas: Some(updated),
            ..Default::default()
        })
    }

    #[test]
    fn phase_follows_pod_counts() {
        assert_eq!(derive_phase(3, &live(1, None)), Phase::Pending);
        assert_eq!(derive_phase(3, &live(1, counts(1, 3, 3, 3))), Phase::Ready);
        assert_eq!(derive_phase(3, &live(1, counts(1, 1, 1, 1))), Phase::ScalingUp);
        assert_eq!(derive_phase(3, &live(1, counts(1, 5, 5, 5))), Phase::ScalingDown);
        assert_eq!(derive_phase(3, &live(1, counts(1, 3, 2, 3))), Phase::Updating);
        // Controller has not caught up with the latest template yet.
        assert_eq!(derive_phase(3, &live(2, counts(1, 3, 3, 3))), Phase::Updating);
        assert_eq!(derive_phase(0, &live(1, counts(1, 0, 0, 0))), Phase::Ready);
    }

    #[test]
    fn unchanged_status_is_not_rewritten() {
        let cluster = ClusterObject {
            api_version: None,
            kind: None,
            key: ObjectKey::new("ns", "foo"),
            uid: Some("u".into()),
            resource_version: None,
            generation: Some(4),
            spec: serde_json::Value::Null,
            status: None,
        };
        let spec = IndexerClusterSpec::default();
        let s = derive_status(&spec, &cluster, &live(1, counts(1, 1, 1, 1)));
        assert_eq!(s.phase, Phase::Ready);
        assert_eq!(s.observed_generation, Some(4));

        let first = next_status(None, s.clone()).unwrap();
        assert!(first.last_transition_time.is_some());
        assert!(next_status(Some(&first), s.clone()).is_none());

        let mut more = s.clone();
        more.ready_replicas = 0;
        more.phase = Phase::Updating;
        let moved = next_status(Some(&first), more).unwrap();
        assert_eq!(moved.phase, Phase::Updating);
        assert!(moved.last_transition_time.is_some());
    }

    #[test]
    fn transition_time_kept_while_phase_holds() {
        let prev = IndexerClusterStatus {
            phase: Phase::ScalingUp,
            replicas: 1,
            last_transition_time: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let next = IndexerClusterStatus { phase: Phase::ScalingUp, replicas: 2, ..Default::default() };
        let out = next_status(Some(&prev), next).unwrap();
        assert_eq!(out.last_transition_time.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(out.replicas, 2);
    }
}
