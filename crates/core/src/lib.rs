//! ixo core types: reconciliation keys, the cluster object model and pass outcomes.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod spec;

pub use spec::{IndexerClusterSpec, IndexerClusterStatus, Phase, SpecError};

pub const GROUP: &str = "ixo.dev";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "IndexerCluster";
pub const PLURAL: &str = "indexerclusters";

/// `group/version` of the IndexerCluster kind.
pub fn api_version() -> String {
    format!("{}/{}", GROUP, VERSION)
}

/// Reconciliation key: namespace + name of an IndexerCluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key {0:?} (expect namespace/name)")]
pub struct ParseKeyError(String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Snapshot of an IndexerCluster as fetched from the API server.
///
/// `spec` and `status` stay opaque JSON here; only ApplyState interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterObject {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub spec: serde_json::Value,
    pub status: Option<serde_json::Value>,
}

impl ClusterObject {
    /// Fill in apiVersion/kind when the server left them out. Existing values are kept.
    pub fn stamp_type_meta(&mut self, api_version: &str, kind: &str) {
        if self.api_version.as_deref().map_or(true, str::is_empty) {
            self.api_version = Some(api_version.to_string());
        }
        if self.kind.as_deref().map_or(true, str::is_empty) {
            self.kind = Some(kind.to_string());
        }
    }
}

/// Outcome of a single reconciliation pass. Produced fresh each pass, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    Converged,
    RequeueNow,
    RequeueAfter(Duration),
    /// Not retried; needs a spec correction to make progress.
    Fatal(String),
}

impl ReconcileResult {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileResult::Converged => "converged",
            ReconcileResult::RequeueNow => "requeue_now",
            ReconcileResult::RequeueAfter(_) => "requeue_after",
            ReconcileResult::Fatal(_) => "fatal",
        }
    }
}

/// What ApplyState asks the loop to do after a successful step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub requeue: bool,
    pub requeue_after: Duration,
}

impl ApplyOutcome {
    pub fn converged() -> Self {
        Self::default()
    }

    /// Convergence still in progress; look again after `d`.
    pub fn requeue_after(d: Duration) -> Self {
        Self { requeue: true, requeue_after: d }
    }
}

/// Failures reported by ApplyState.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// API hiccup or expected temporary inconsistency; retried after `retry_after`.
    #[error("{message}")]
    Transient { message: String, retry_after: Duration },
    /// Desired state is malformed or unsatisfiable.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

impl ApplyError {
    pub fn transient(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient { message: message.into(), retry_after }
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec(message.into())
    }
}

pub mod prelude {
    pub use super::{ApplyError, ApplyOutcome, ClusterObject, ObjectKey, ReconcileResult};
}
