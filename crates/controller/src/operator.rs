//! Operator wiring: event sources, queue, reconciler and workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::Stream;
use ixo_apply::IndexerClusterApplier;
use ixo_core::ObjectKey;
use ixo_kubehub::events::{cluster_stream, workload_stream};
use ixo_kubehub::{get_kube_client, ClusterApi, EventSource, KubeHub, WatchItem};
use ixo_queue::WorkQueue;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::core::DynamicObject;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};

use crate::config::OperatorConfig;
use crate::reconciler::IndexerClusterReconciler;
use crate::worker::Controller;

/// A running operator. Dropping it leaves the tasks running; call [`shutdown`](Self::shutdown).
pub struct Operator {
    queue: Arc<WorkQueue<ObjectKey>>,
    watchers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Start the loop against `api`, fed by the two watch streams.
pub fn start<C, CS, WS>(api: Arc<C>, clusters: CS, workloads: WS, cfg: &OperatorConfig) -> Operator
where
    C: ClusterApi + 'static,
    CS: Stream<Item = WatchItem<DynamicObject>> + Send + 'static,
    WS: Stream<Item = WatchItem<StatefulSet>> + Send + 'static,
{
    let queue = WorkQueue::new("indexercluster", cfg.backoff);
    let source = EventSource::new(Arc::clone(&queue));
    let watchers = vec![
        tokio::spawn({
            let source = source.clone();
            async move { source.pump_clusters(clusters).await }
        }),
        tokio::spawn(async move { source.pump_workloads(workloads).await }),
    ];

    let applier = Arc::new(IndexerClusterApplier::with_options(Arc::clone(&api), cfg.apply_options()));
    let span = info_span!("controller", controller = "indexercluster");
    let reconciler = Arc::new(IndexerClusterReconciler::new(api, applier, cfg.reconcile_options(), span));
    let workers = Controller::new(reconciler, Arc::clone(&queue)).workers(cfg.workers).spawn();

    info!(
        workers = cfg.workers,
        namespace = cfg.namespace.as_deref().unwrap_or("*"),
        error_requeue_floor_ms = cfg.error_requeue_floor.as_millis() as u64,
        "operator started"
    );
    Operator { queue, watchers, workers }
}

impl Operator {
    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Stop watching, stop handing out keys and give in-flight passes `grace` to finish.
    /// Nothing is persisted; the next start resyncs from a full list.
    pub async fn shutdown(self, grace: Duration) {
        self.queue.shut_down();
        for w in &self.watchers {
            w.abort();
        }
        let drain = futures::future::join_all(self.workers);
        match tokio::time::timeout(grace, drain).await {
            Ok(_) => info!("operator stopped"),
            Err(_) => warn!(grace_secs = grace.as_secs(), "workers still busy after grace period; abandoning"),
        }
    }
}

/// Run against the cluster from kubeconfig or the in-cluster environment until Ctrl-C.
pub async fn run(cfg: OperatorConfig) -> Result<()> {
    let client = get_kube_client().await?;
    let ns = cfg.namespace.as_deref();
    let clusters = cluster_stream(client.clone(), ns);
    let workloads = workload_stream(client.clone(), ns);
    let op = start(Arc::new(KubeHub::new(client)), clusters, workloads, &cfg);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    op.shutdown(cfg.shutdown_grace).await;
    Ok(())
}
