//! In-memory API server stand-in for tests and demos.
//!
//! Tracks resource versions and generations, rejects stale replaces with 409,
//! fans watch events out to subscribers, and garbage collects workloads whose
//! controlling owner is deleted.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use kube::{
    core::{ApiResource, DynamicObject},
    runtime::watcher::Event,
};
use ixo_core::{ClusterObject, ObjectKey};
use serde_json::Value;

use crate::{api_error, api_resource, cluster_from, ClusterApi, ClusterReader, WatchItem};

/// Call counters, for asserting on side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub cluster_reads: usize,
    pub workload_creates: usize,
    pub workload_replaces: usize,
    pub status_writes: usize,
}

struct Inner {
    clusters: BTreeMap<ObjectKey, DynamicObject>,
    workloads: BTreeMap<ObjectKey, StatefulSet>,
    next_rv: u64,
    next_uid: u64,
    auto_ready: bool,
    stats: HubStats,
    fail_writes: VecDeque<kube::Error>,
    cluster_subs: Vec<UnboundedSender<WatchItem<DynamicObject>>>,
    workload_subs: Vec<UnboundedSender<WatchItem<StatefulSet>>>,
}

impl Inner {
    fn rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.next_uid)
    }

    fn emit_cluster(&mut self, obj: &DynamicObject, deleted: bool) {
        self.cluster_subs.retain(|tx| {
            let ev = if deleted { Event::Deleted(obj.clone()) } else { Event::Applied(obj.clone()) };
            tx.unbounded_send(Ok(ev)).is_ok()
        });
    }

    fn emit_workload(&mut self, sts: &StatefulSet, deleted: bool) {
        self.workload_subs.retain(|tx| {
            let ev = if deleted { Event::Deleted(sts.clone()) } else { Event::Applied(sts.clone()) };
            tx.unbounded_send(Ok(ev)).is_ok()
        });
    }

    fn settle(&self, sts: &mut StatefulSet) {
        let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let generation = sts.metadata.generation;
        let prev = sts.status.take().unwrap_or_default();
        sts.status = Some(if self.auto_ready {
            StatefulSetStatus {
                replicas: desired,
                ready_replicas: Some(desired),
                current_replicas: Some(desired),
                updated_replicas: Some(desired),
                available_replicas: Some(desired),
                observed_generation: generation,
                ..Default::default()
            }
        } else {
            StatefulSetStatus { observed_generation: generation, ..prev }
        });
    }
}

pub struct MemoryHub {
    ar: ApiResource,
    inner: Mutex<Inner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Empty hub whose workloads become ready as soon as they are written.
    pub fn new() -> Self {
        Self {
            ar: api_resource(),
            inner: Mutex::new(Inner {
                clusters: BTreeMap::new(),
                workloads: BTreeMap::new(),
                next_rv: 0,
                next_uid: 0,
                auto_ready: true,
                stats: HubStats::default(),
                fail_writes: VecDeque::new(),
                cluster_subs: Vec::new(),
                workload_subs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When off, written workloads keep their previous pod counts until [`mark_ready`](Self::mark_ready).
    pub fn set_auto_ready(&self, on: bool) {
        self.lock().auto_ready = on;
    }

    /// Fail the next write (create/replace/status) with `err`.
    pub fn fail_next_write(&self, err: kube::Error) {
        self.lock().fail_writes.push_back(err);
    }

    pub fn stats(&self) -> HubStats {
        self.lock().stats
    }

    /// Watch stream of IndexerClusters, starting with a `Restarted` listing.
    pub fn cluster_events(&self) -> UnboundedReceiver<WatchItem<DynamicObject>> {
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        let list: Vec<_> = inner.clusters.values().cloned().collect();
        if tx.unbounded_send(Ok(Event::Restarted(list))).is_ok() {
            inner.cluster_subs.push(tx);
        }
        rx
    }

    /// Watch stream of StatefulSets, starting with a `Restarted` listing.
    pub fn workload_events(&self) -> UnboundedReceiver<WatchItem<StatefulSet>> {
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        let list: Vec<_> = inner.workloads.values().cloned().collect();
        if tx.unbounded_send(Ok(Event::Restarted(list))).is_ok() {
            inner.workload_subs.push(tx);
        }
        rx
    }

    /// Create or update an IndexerCluster's spec, as an external actor would.
    pub fn put_cluster(&self, namespace: &str, name: &str, spec: Value) -> ObjectKey {
        let key = ObjectKey::new(namespace, name);
        let mut inner = self.lock();
        let rv = inner.rv();
        let obj = match inner.clusters.get(&key).cloned() {
            Some(mut obj) => {
                if obj.data.get("spec") != Some(&spec) {
                    obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
                }
                match obj.data.as_object_mut() {
                    Some(m) => {
                        m.insert("spec".into(), spec);
                    }
                    None => obj.data = serde_json::json!({ "spec": spec }),
                }
                obj.metadata.resource_version = Some(rv);
                obj
            }
            None => {
                let mut obj = DynamicObject::new(name, &self.ar).within(namespace).data(serde_json::json!({ "spec": spec }));
                obj.metadata.uid = Some(inner.uid());
                obj.metadata.generation = Some(1);
                obj.metadata.resource_version = Some(rv);
                obj
            }
        };
        inner.clusters.insert(key.clone(), obj.clone());
        inner.emit_cluster(&obj, false);
        key
    }

    /// Delete an IndexerCluster and cascade to workloads it controls.
    pub fn delete_cluster(&self, key: &ObjectKey) -> bool {
        let mut inner = self.lock();
        let Some(obj) = inner.clusters.remove(key) else { return false };
        let uid = obj.metadata.uid.clone();
        let orphans: Vec<ObjectKey> = inner
            .workloads
            .iter()
            .filter(|(_, sts)| {
                sts.metadata
                    .owner_references
                    .as_ref()
                    .map_or(false, |ors| ors.iter().any(|o| o.controller == Some(true) && Some(&o.uid) == uid.as_ref()))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in orphans {
            if let Some(sts) = inner.workloads.remove(&k) {
                inner.emit_workload(&sts, true);
            }
        }
        inner.emit_cluster(&obj, true);
        true
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.lock().clusters.get(key).and_then(cluster_from)
    }

    pub fn workload(&self, key: &ObjectKey) -> Option<StatefulSet> {
        self.lock().workloads.get(key).cloned()
    }

    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    /// Seed a workload directly, bypassing ownership checks.
    pub fn put_workload(&self, mut sts: StatefulSet) -> ObjectKey {
        let mut inner = self.lock();
        let key = ObjectKey::new(
            sts.metadata.namespace.clone().unwrap_or_default(),
            sts.metadata.name.clone().unwrap_or_default(),
        );
        if sts.metadata.uid.is_none() {
            sts.metadata.uid = Some(inner.uid());
        }
        sts.metadata.resource_version = Some(inner.rv());
        sts.metadata.generation = Some(sts.metadata.generation.unwrap_or(0) + 1);
        inner.settle(&mut sts);
        inner.workloads.insert(key.clone(), sts.clone());
        inner.emit_workload(&sts, false);
        key
    }

    /// Rogue actor: change replicas behind the operator's back.
    pub fn scale_workload(&self, key: &ObjectKey, replicas: i32) -> bool {
        let mut inner = self.lock();
        let Some(mut sts) = inner.workloads.get(key).cloned() else { return false };
        sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        sts.metadata.generation = Some(sts.metadata.generation.unwrap_or(0) + 1);
        sts.metadata.resource_version = Some(inner.rv());
        inner.settle(&mut sts);
        inner.workloads.insert(key.clone(), sts.clone());
        inner.emit_workload(&sts, false);
        true
    }

    /// Report every pod of the workload as ready and updated.
    pub fn mark_ready(&self, key: &ObjectKey) -> bool {
        let mut inner = self.lock();
        let Some(mut sts) = inner.workloads.get(key).cloned() else { return false };
        let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        sts.status = Some(StatefulSetStatus {
            replicas: desired,
            ready_replicas: Some(desired),
            current_replicas: Some(desired),
            updated_replicas: Some(desired),
            available_replicas: Some(desired),
            observed_generation: sts.metadata.generation,
            ..Default::default()
        });
        sts.metadata.resource_version = Some(inner.rv());
        inner.workloads.insert(key.clone(), sts.clone());
        inner.emit_workload(&sts, false);
        true
    }

    fn take_failure(&self) -> Option<kube::Error> {
        self.lock().fail_writes.pop_front()
    }
}

/// RFC 7386 merge of `patch` into `target`.
fn merge_patch(target: &mut Value, patch: &Value) {
    if let (Some(t), Some(p)) = (target.as_object_mut(), patch.as_object()) {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        return;
    }
    *target = patch.clone();
}

#[async_trait]
impl ClusterReader for MemoryHub {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, kube::Error> {
        let mut inner = self.lock();
        inner.stats.cluster_reads += 1;
        Ok(inner.clusters.get(key).and_then(cluster_from))
    }
}

#[async_trait]
impl ClusterApi for MemoryHub {
    async fn patch_cluster_status(&self, key: &ObjectKey, status: &Value) -> Result<(), kube::Error> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let mut inner = self.lock();
        let rv = inner.rv();
        let Some(obj) = inner.clusters.get_mut(key) else {
            return Err(api_error(404, "NotFound", format!("indexerclusters {:?} not found", key.name)));
        };
        if !obj.data.is_object() {
            obj.data = serde_json::json!({});
        }
        merge_patch(&mut obj.data, &serde_json::json!({ "status": status }));
        obj.metadata.resource_version = Some(rv);
        let obj = obj.clone();
        inner.stats.status_writes += 1;
        inner.emit_cluster(&obj, false);
        Ok(())
    }

    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, kube::Error> {
        Ok(self.lock().workloads.get(key).cloned())
    }

    async fn create_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let mut inner = self.lock();
        if inner.workloads.contains_key(key) {
            return Err(api_error(409, "AlreadyExists", format!("statefulsets {:?} already exists", key.name)));
        }
        let mut sts = workload.clone();
        sts.metadata.name = Some(key.name.clone());
        sts.metadata.namespace = Some(key.namespace.clone());
        sts.metadata.uid = Some(inner.uid());
        sts.metadata.resource_version = Some(inner.rv());
        sts.metadata.generation = Some(1);
        sts.status = None;
        inner.settle(&mut sts);
        inner.workloads.insert(key.clone(), sts.clone());
        inner.stats.workload_creates += 1;
        inner.emit_workload(&sts, false);
        Ok(sts)
    }

    async fn replace_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let mut inner = self.lock();
        let Some(live) = inner.workloads.get(key).cloned() else {
            return Err(api_error(404, "NotFound", format!("statefulsets {:?} not found", key.name)));
        };
        if workload.metadata.resource_version.is_some() && workload.metadata.resource_version != live.metadata.resource_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object has been modified; please apply your changes to the latest version (statefulsets {:?})", key.name),
            ));
        }
        let mut sts = workload.clone();
        sts.metadata.uid = live.metadata.uid.clone();
        sts.metadata.resource_version = Some(inner.rv());
        let spec_changed = serde_json::to_value(&sts.spec).ok() != serde_json::to_value(&live.spec).ok();
        let generation = live.metadata.generation.unwrap_or(1);
        sts.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        // Replace ignores status; it belongs to the status subresource.
        sts.status = live.status.clone();
        inner.settle(&mut sts);
        inner.workloads.insert(key.clone(), sts.clone());
        inner.stats.workload_replaces += 1;
        inner.emit_workload(&sts, false);
        Ok(sts)
    }
}
