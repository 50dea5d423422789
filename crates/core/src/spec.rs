//! IndexerCluster payload types. Only ApplyState reads these; the loop treats them as opaque.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "ixo/indexer:latest";

/// Label keys owned by the operator; user labels may not override them.
pub const RESERVED_LABELS: [&str; 3] = [
    "app.kubernetes.io/name",
    "app.kubernetes.io/instance",
    "app.kubernetes.io/managed-by",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("decoding spec: {0}")]
    Decode(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerClusterSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Extra labels propagated to the workload and its pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_replicas() -> i32 { 1 }

fn default_image() -> String { DEFAULT_IMAGE.to_string() }

impl Default for IndexerClusterSpec {
    fn default() -> Self {
        Self { replicas: default_replicas(), image: default_image(), image_pull_policy: None, labels: BTreeMap::new() }
    }
}

impl IndexerClusterSpec {
    /// Decode and validate the raw `spec` payload. `null` decodes to defaults.
    pub fn from_value(v: &serde_json::Value) -> Result<Self, SpecError> {
        let spec: Self = if v.is_null() {
            Self::default()
        } else {
            serde_json::from_value(v.clone()).map_err(|e| SpecError::Decode(e.to_string()))?
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.replicas < 0 {
            return Err(SpecError::Invalid(format!("replicas must be >= 0 (got {})", self.replicas)));
        }
        if self.image.trim().is_empty() {
            return Err(SpecError::Invalid("image must not be empty".into()));
        }
        if let Some(p) = self.image_pull_policy.as_deref() {
            if !matches!(p, "Always" | "IfNotPresent" | "Never") {
                return Err(SpecError::Invalid(format!("unsupported imagePullPolicy {:?}", p)));
            }
        }
        if let Some(k) = self.labels.keys().find(|k| RESERVED_LABELS.contains(&k.as_str())) {
            return Err(SpecError::Invalid(format!("label {:?} is managed by the operator", k)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Updating,
    ScalingUp,
    ScalingDown,
    Ready,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Updating => "Updating",
            Phase::ScalingUp => "ScalingUp",
            Phase::ScalingDown => "ScalingDown",
            Phase::Ready => "Ready",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Advisory status written by ApplyState. Never read back to make decisions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerClusterStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl IndexerClusterStatus {
    /// Best-effort decode of a previously written status; garbage reads as absent.
    pub fn from_value(v: Option<&serde_json::Value>) -> Option<Self> {
        v.and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Equal ignoring the transition timestamp.
    pub fn same_as(&self, other: &Self) -> bool {
        Self { last_transition_time: None, ..self.clone() } == Self { last_transition_time: None, ..other.clone() }
    }
}
