//! ixo controller: the level-triggered reconciliation loop.
//!
//! Event sources feed [`ObjectKey`]s into a shared [`WorkQueue`](ixo_queue::WorkQueue);
//! a fixed pool of workers pulls keys, runs a [`Reconciler`] and routes the outcome
//! through a [`RequeuePolicy`]. Nothing about a key is remembered between passes.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use ixo_core::{ObjectKey, ReconcileResult};

pub mod config;
pub mod operator;
pub mod policy;
pub mod reconciler;
pub mod worker;

pub use config::OperatorConfig;
pub use operator::{run, start, Operator};
pub use policy::{DefaultRequeuePolicy, RequeuePolicy};
pub use reconciler::{IndexerClusterReconciler, ReconcileOptions};
pub use worker::Controller;

/// One convergence pass for a key. Never fails: every outcome is a scheduling decision.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name, used in logs and metric labels.
    fn name(&self) -> &str;

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult;
}
