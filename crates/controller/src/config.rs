//! Operator knobs, from defaults or `IXO_*` environment variables.

use std::time::Duration;

use ixo_apply::ApplyOptions;
use ixo_queue::Backoff;

use crate::reconciler::ReconcileOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub workers: usize,
    /// Watch a single namespace; `None` watches all of them.
    pub namespace: Option<String>,
    pub error_requeue_floor: Duration,
    pub backoff: Backoff,
    pub progress_requeue: Duration,
    pub shutdown_grace: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            namespace: None,
            error_requeue_floor: Duration::from_millis(1000),
            backoff: Backoff::default(),
            progress_requeue: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl OperatorConfig {
    /// Defaults overridden by whatever is set in the environment. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let num = |name: &str| get(name).and_then(|s| s.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            workers: num("IXO_WORKERS").map_or(d.workers, |n| (n as usize).max(1)),
            namespace: get("WATCH_NAMESPACE").map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            error_requeue_floor: num("IXO_ERROR_REQUEUE_FLOOR_MS").map_or(d.error_requeue_floor, Duration::from_millis),
            backoff: Backoff {
                base: num("IXO_BACKOFF_BASE_MS").map_or(d.backoff.base, Duration::from_millis),
                max: num("IXO_BACKOFF_MAX_SECS").map_or(d.backoff.max, Duration::from_secs),
            },
            progress_requeue: num("IXO_PROGRESS_REQUEUE_SECS").map_or(d.progress_requeue, Duration::from_secs),
            shutdown_grace: num("IXO_SHUTDOWN_GRACE_SECS").map_or(d.shutdown_grace, Duration::from_secs),
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions { error_requeue_floor: self.error_requeue_floor }
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions { progress_requeue: self.progress_requeue, ..ApplyOptions::default() }
    }
}
