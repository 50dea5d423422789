//! Desired StatefulSet for an IndexerCluster and its owner linkage.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use ixo_core::{api_version, ClusterObject, IndexerClusterSpec, ObjectKey, KIND};

use crate::diff::{diff_summary, DiffSummary};

pub const CONTAINER_NAME: &str = "indexer";

/// Annotation carrying the IndexerCluster spec the workload was last written from.
/// Fields dropped from the spec show up as a changed value here.
pub const APPLIED_SPEC_ANNOTATION: &str = "ixo.dev/applied-spec";

/// Fixed indexer ports: (name, port).
pub const PORTS: [(&str, i32); 3] = [("management", 8089), ("ingest", 9997), ("replication", 9887)];

pub fn workload_name(cluster: &str) -> String {
    format!("{}-indexer", cluster)
}

/// Key of the StatefulSet managed for the cluster at `key`.
pub fn workload_key(key: &ObjectKey) -> ObjectKey {
    ObjectKey::new(key.namespace.clone(), workload_name(&key.name))
}

pub fn selector_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "indexer".to_string()),
        ("app.kubernetes.io/instance".to_string(), cluster.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "ixo".to_string()),
    ])
}

/// Label selector in `k=v,k=v` form, as reported in status.
pub fn selector_string(cluster: &str) -> String {
    selector_labels(cluster).iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Controlling back-reference to the IndexerCluster. Set once, at creation.
pub fn owner_reference(cluster: &ClusterObject, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: cluster.api_version.clone().unwrap_or_else(api_version),
        kind: cluster.kind.clone().unwrap_or_else(|| KIND.to_string()),
        name: cluster.key.name.clone(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The controlling owner of an object, if it has one.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|o| o.controller == Some(true))
}

pub fn build_statefulset(cluster: &ClusterObject, spec: &IndexerClusterSpec, uid: &str) -> StatefulSet {
    let name = workload_name(&cluster.key.name);
    let selector = selector_labels(&cluster.key.name);
    let mut labels = spec.labels.clone();
    labels.extend(selector.clone());

    let ports = PORTS
        .iter()
        .map(|(n, p)| ContainerPort { name: Some((*n).to_string()), container_port: *p, protocol: Some("TCP".into()), ..Default::default() })
        .collect();
    let container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(spec.image.clone()),
        image_pull_policy: spec.image_pull_policy.clone(),
        ports: Some(ports),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(cluster.key.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(BTreeMap::from([(
                APPLIED_SPEC_ANNOTATION.to_string(),
                serde_json::to_string(spec).unwrap_or_default(),
            )])),
            owner_references: Some(vec![owner_reference(cluster, uid)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            service_name: format!("{}-headless", name),
            pod_management_policy: Some("Parallel".into()),
            update_strategy: Some(StatefulSetUpdateStrategy { type_: Some("RollingUpdate".into()), ..Default::default() }),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn managed_fields(sts: &StatefulSet) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "labels": sts.metadata.labels, "annotations": sts.metadata.annotations },
        "spec": sts.spec,
    })
}

/// The spec recorded on a workload by a previous write, if any.
pub fn applied_spec(sts: &StatefulSet) -> Option<IndexerClusterSpec> {
    let raw = sts.metadata.annotations.as_ref()?.get(APPLIED_SPEC_ANNOTATION)?;
    serde_json::from_str(raw).ok()
}

/// How far `live` is from containing `desired`'s managed fields (labels, annotations and spec).
/// Server-side extras are ignored; removals from the IndexerCluster spec surface through
/// the applied-spec annotation.
pub fn drift(desired: &StatefulSet, live: &StatefulSet) -> DiffSummary {
    diff_summary(&managed_fields(desired), &managed_fields(live))
}

/// Next object to send on replace: the live object (keeping its resourceVersion and owner
/// references) with the desired spec, labels and annotations laid over it.
pub fn merge_desired(live: &StatefulSet, desired: &StatefulSet) -> StatefulSet {
    let mut next = live.clone();
    let mut labels = live.metadata.labels.clone().unwrap_or_default();
    // Labels we put there earlier and the spec no longer asks for.
    if let Some(prev) = applied_spec(live) {
        for k in prev.labels.keys() {
            labels.remove(k);
        }
    }
    labels.extend(desired.metadata.labels.clone().unwrap_or_default());
    next.metadata.labels = Some(labels);
    let mut annotations = live.metadata.annotations.clone().unwrap_or_default();
    annotations.extend(desired.metadata.annotations.clone().unwrap_or_default());
    next.metadata.annotations = Some(annotations);
    next.spec = desired.spec.clone();
    next.status = None;
    next
}
