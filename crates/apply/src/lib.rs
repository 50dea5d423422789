//! ixo apply: drives the managed StatefulSet toward an IndexerCluster's spec and reports status.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ixo_core::{ApplyError, ApplyOutcome, ClusterObject, IndexerClusterSpec, IndexerClusterStatus, Phase, KIND};
use ixo_kubehub::{error_code, ClusterApi};
use k8s_openapi::api::apps::v1::StatefulSet;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod diff;
pub mod status;
pub mod workload;

pub use diff::{diff_summary, DiffSummary};
use status::{derive_status, error_status, next_status};
use workload::{build_statefulset, controller_of, drift, merge_desired, workload_key};

/// Idempotent convergence step for one IndexerCluster.
///
/// Implementations may be called any number of times for the same object and must
/// not create duplicates; they are the only place that interprets `spec` and `status`.
#[async_trait]
pub trait ApplyState: Send + Sync {
    async fn apply(&self, cluster: &ClusterObject) -> Result<ApplyOutcome, ApplyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Look again this soon while pods are still rolling.
    pub progress_requeue: Duration,
    /// Retry after a 409 from the API server.
    pub conflict_retry: Duration,
    /// Retry after any other API failure.
    pub error_retry: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            progress_requeue: Duration::from_secs(5),
            conflict_retry: Duration::from_secs(1),
            error_retry: Duration::from_secs(5),
        }
    }
}

/// Map an API failure onto the loop's error taxonomy.
pub fn classify(opts: &ApplyOptions, what: &str, err: kube::Error) -> ApplyError {
    let code = error_code(&err);
    let reason = match code {
        Some(409) => "conflict",
        Some(400) | Some(422) => "invalid",
        Some(_) => "api",
        None => "transport",
    };
    counter!("apply_err_total", 1u64, "reason" => reason);
    match code {
        Some(409) => ApplyError::transient(format!("{}: {}", what, err), opts.conflict_retry),
        Some(400) | Some(422) => ApplyError::invalid_spec(format!("{}: {}", what, err)),
        _ => ApplyError::transient(format!("{}: {}", what, err), opts.error_retry),
    }
}

/// ApplyState backed by a StatefulSet per IndexerCluster.
pub struct IndexerClusterApplier<C> {
    api: Arc<C>,
    opts: ApplyOptions,
}

impl<C: ClusterApi> IndexerClusterApplier<C> {
    pub fn new(api: Arc<C>) -> Self {
        Self::with_options(api, ApplyOptions::default())
    }

    pub fn with_options(api: Arc<C>, opts: ApplyOptions) -> Self {
        Self { api, opts }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.opts
    }

    /// Create the workload when absent, replace it when it drifted, leave it alone otherwise.
    async fn ensure_workload(&self, cluster: &ClusterObject, spec: &IndexerClusterSpec, uid: &str) -> Result<StatefulSet, ApplyError> {
        let key = workload_key(&cluster.key);
        let desired = build_statefulset(cluster, spec, uid);
        let live = self.api.get_workload(&key).await.map_err(|e| classify(&self.opts, "reading workload", e))?;
        let Some(live) = live else {
            let created = self.api.create_workload(&key, &desired).await.map_err(|e| classify(&self.opts, "creating workload", e))?;
            counter!("apply_workload_created_total", 1u64);
            info!(workload = %key, replicas = spec.replicas, "workload created");
            return Ok(created);
        };

        match controller_of(&live.metadata) {
            Some(owner) if owner.uid == uid => {}
            Some(owner) if owner.kind == KIND && owner.name == cluster.key.name => {
                // Left over from a deleted cluster of the same name.
                return Err(ApplyError::transient(
                    format!("workload {} still owned by a previous incarnation (uid {}); waiting for garbage collection", key, owner.uid),
                    self.opts.error_retry,
                ));
            }
            Some(owner) => {
                return Err(ApplyError::invalid_spec(format!("workload {} is controlled by {} {}", key, owner.kind, owner.name)));
            }
            None => {
                return Err(ApplyError::invalid_spec(format!("workload {} exists and is not managed by this cluster", key)));
            }
        }

        let d = drift(&desired, &live);
        if d.converged() {
            debug!(workload = %key, "workload up to date");
            return Ok(live);
        }
        let next = merge_desired(&live, &desired);
        let replaced = self.api.replace_workload(&key, &next).await.map_err(|e| classify(&self.opts, "updating workload", e))?;
        counter!("apply_workload_updated_total", 1u64);
        info!(workload = %key, adds = d.adds, updates = d.updates, replicas = spec.replicas, "workload updated");
        Ok(replaced)
    }

    async fn write_status(&self, cluster: &ClusterObject, next: IndexerClusterStatus) -> Result<(), ApplyError> {
        let prev = IndexerClusterStatus::from_value(cluster.status.as_ref());
        let Some(next) = next_status(prev.as_ref(), next) else { return Ok(()) };
        let mut body = serde_json::to_value(&next).map_err(|e| ApplyError::transient(format!("encoding status: {}", e), self.opts.error_retry))?;
        if next.message.is_none() {
            // Merge patch keeps absent keys; clear a stale message explicitly.
            body["message"] = serde_json::Value::Null;
        }
        self.api
            .patch_cluster_status(&cluster.key, &body)
            .await
            .map_err(|e| classify(&self.opts, "writing status", e))?;
        counter!("apply_status_writes_total", 1u64);
        debug!(key = %cluster.key, phase = %next.phase, "status written");
        Ok(())
    }

    /// Best-effort `phase=Error` report; the caller fails the pass either way.
    async fn report_invalid(&self, cluster: &ClusterObject, message: &str) {
        let prev = IndexerClusterStatus::from_value(cluster.status.as_ref());
        if let Err(e) = self.write_status(cluster, error_status(cluster, prev.as_ref(), message)).await {
            warn!(key = %cluster.key, error = %e, "could not record error status");
        }
    }

    async fn converge(&self, cluster: &ClusterObject) -> Result<ApplyOutcome, ApplyError> {
        let spec = match IndexerClusterSpec::from_value(&cluster.spec) {
            Ok(spec) => spec,
            Err(e) => {
                let message = e.to_string();
                self.report_invalid(cluster, &message).await;
                return Err(ApplyError::InvalidSpec(message));
            }
        };
        let Some(uid) = cluster.uid.as_deref() else {
            return Err(ApplyError::transient("cluster has no uid yet", self.opts.error_retry));
        };

        let live = match self.ensure_workload(cluster, &spec, uid).await {
            Err(ApplyError::InvalidSpec(message)) => {
                self.report_invalid(cluster, &message).await;
                return Err(ApplyError::InvalidSpec(message));
            }
            other => other?,
        };

        let status = derive_status(&spec, cluster, &live);
        let phase = status.phase;
        self.write_status(cluster, status).await?;
        if phase == Phase::Ready {
            Ok(ApplyOutcome::converged())
        } else {
            debug!(key = %cluster.key, %phase, "waiting for workload to settle");
            Ok(ApplyOutcome::requeue_after(self.opts.progress_requeue))
        }
    }
}

#[async_trait]
impl<C: ClusterApi> ApplyState for IndexerClusterApplier<C> {
    async fn apply(&self, cluster: &ClusterObject) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        let res = self.converge(cluster).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }
}
