//! Event source: turns IndexerCluster and StatefulSet watch events into reconciliation keys.

use std::sync::Arc;

use futures::{stream::BoxStream, Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client,
};
use metrics::counter;
use ixo_core::{ObjectKey, GROUP, KIND};
use ixo_queue::WorkQueue;
use tracing::{debug, info, trace, warn};

use crate::api_resource;

pub type WatchItem<K> = Result<Event<K>, watcher::Error>;

/// Key of an IndexerCluster itself.
pub fn cluster_key(obj: &DynamicObject) -> Option<ObjectKey> {
    Some(ObjectKey::new(obj.metadata.namespace.clone()?, obj.metadata.name.clone()?))
}

/// Key of the IndexerCluster controlling this object, if any.
///
/// Only the controlling owner counts, and only when it is an IndexerCluster of our group
/// (any version). Owner references are namespace-local, so the owner lives in the child's namespace.
pub fn owner_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    let ns = meta.namespace.as_deref()?;
    let owner = meta.owner_references.as_ref()?.iter().find(|o| o.controller == Some(true))?;
    let group = owner.api_version.split_once('/').map_or("", |(g, _)| g);
    if group != GROUP || owner.kind != KIND || owner.name.is_empty() {
        return None;
    }
    Some(ObjectKey::new(ns, owner.name.clone()))
}

pub fn workload_owner_key(sts: &StatefulSet) -> Option<ObjectKey> {
    owner_key(&sts.metadata)
}

/// Watch stream of IndexerClusters, all namespaces or one.
pub fn cluster_stream(client: Client, namespace: Option<&str>) -> BoxStream<'static, WatchItem<DynamicObject>> {
    let ar = api_resource();
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    watcher::watcher(api, watcher::Config::default()).default_backoff().boxed()
}

/// Watch stream of StatefulSets. Ownership filtering happens when mapping to keys.
pub fn workload_stream(client: Client, namespace: Option<&str>) -> BoxStream<'static, WatchItem<StatefulSet>> {
    let api: Api<StatefulSet> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    watcher::watcher(api, watcher::Config::default()).default_backoff().boxed()
}

/// Feeds keys into the work queue. Delivery is fire-and-forget.
#[derive(Clone)]
pub struct EventSource {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EventSource {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { queue }
    }

    fn offer(&self, source: &'static str, key: Option<ObjectKey>) {
        match key {
            Some(key) => {
                counter!("events_enqueued_total", 1u64, "source" => source);
                trace!(source, key = %key, "enqueue");
                self.queue.add(key);
            }
            None => {
                counter!("events_ignored_total", 1u64, "source" => source);
            }
        }
    }

    /// Drain `stream`, mapping every object it reports through `map`. Returns when the stream ends.
    pub async fn pump<K, S, F>(&self, source: &'static str, stream: S, map: F)
    where
        S: Stream<Item = WatchItem<K>>,
        F: Fn(&K) -> Option<ObjectKey>,
    {
        futures::pin_mut!(stream);
        info!(source, "event source started");
        while let Some(item) = stream.next().await {
            match item {
                Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => self.offer(source, map(&o)),
                Ok(Event::Restarted(list)) => {
                    debug!(source, count = list.len(), "watch restart");
                    for o in list.iter() {
                        self.offer(source, map(o));
                    }
                }
                Err(e) => warn!(source, error = %e, "watch error; backing off"),
            }
        }
        warn!(source, "event source stream ended");
    }

    pub async fn pump_clusters<S>(&self, stream: S)
    where
        S: Stream<Item = WatchItem<DynamicObject>>,
    {
        self.pump("indexercluster", stream, cluster_key).await
    }

    pub async fn pump_workloads<S>(&self, stream: S)
    where
        S: Stream<Item = WatchItem<StatefulSet>>,
    {
        self.pump("statefulset", stream, workload_owner_key).await
    }
}
