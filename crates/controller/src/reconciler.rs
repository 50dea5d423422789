//! IndexerCluster reconciler: fetch, normalize, apply, decide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ixo_apply::ApplyState;
use ixo_core::{api_version, ApplyError, ObjectKey, ReconcileResult, KIND};
use ixo_kubehub::ClusterReader;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Minimum delay before retrying after a transient apply error. Zero disables the floor.
    pub error_requeue_floor: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { error_requeue_floor: Duration::from_secs(1) }
    }
}

pub struct IndexerClusterReconciler<R, A> {
    reader: Arc<R>,
    apply: Arc<A>,
    opts: ReconcileOptions,
    span: Span,
}

impl<R: ClusterReader, A: ApplyState> IndexerClusterReconciler<R, A> {
    /// `span` is the parent of every per-pass span; pass `Span::current()` to inherit the caller's.
    pub fn new(reader: Arc<R>, apply: Arc<A>, opts: ReconcileOptions, span: Span) -> Self {
        Self { reader, apply, opts, span }
    }

    fn after(d: Duration) -> ReconcileResult {
        if d.is_zero() {
            ReconcileResult::RequeueNow
        } else {
            ReconcileResult::RequeueAfter(d)
        }
    }

    async fn pass(&self, key: &ObjectKey) -> ReconcileResult {
        info!("reconciling IndexerCluster");
        let mut cluster = match self.reader.get_cluster(key).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                debug!("IndexerCluster not found; owned resources are left to garbage collection");
                return ReconcileResult::Converged;
            }
            Err(e) => {
                warn!(error = %e, "reading IndexerCluster failed");
                return ReconcileResult::RequeueNow;
            }
        };
        cluster.stamp_type_meta(&api_version(), KIND);

        match self.apply.apply(&cluster).await {
            Ok(out) if !out.requeue => {
                info!("IndexerCluster reconciliation complete");
                ReconcileResult::Converged
            }
            Ok(out) => {
                info!(requeue_after = ?out.requeue_after, "IndexerCluster reconciliation requeued");
                Self::after(out.requeue_after)
            }
            Err(ApplyError::Transient { message, retry_after }) => {
                let delay = retry_after.max(self.opts.error_requeue_floor);
                warn!(requeue_after = ?delay, error = %message, "IndexerCluster reconciliation requeued");
                Self::after(delay)
            }
            Err(ApplyError::InvalidSpec(message)) => {
                error!(error = %message, "IndexerCluster spec cannot be applied; waiting for a spec change");
                ReconcileResult::Fatal(message)
            }
        }
    }
}

#[async_trait]
impl<R, A> Reconciler for IndexerClusterReconciler<R, A>
where
    R: ClusterReader + 'static,
    A: ApplyState + 'static,
{
    fn name(&self) -> &str {
        "indexercluster"
    }

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let span = info_span!(parent: &self.span, "reconcile", namespace = %key.namespace, name = %key.name);
        self.pass(key).instrument(span).await
    }
}
