//! Minimal JSON diffs between a desired object and what the server holds.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    /// True when `target` is already contained in `base`. Removes are server-side extras
    /// (defaulted fields, injected containers) and do not count.
    pub fn converged(&self) -> bool { self.adds == 0 && self.updates == 0 }
}

/// Count how `base` would have to change to contain `target`. Arrays are compared element-wise
/// and recursively so server-defaulted fields inside list items are not reported as updates.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for (av, bv) in aa.iter().zip(bb.iter()) {
                    if av != bv { walk(av, bv, s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let target = serde_json::json!({
            "a": 2,                  // scalar update
            "b": { "x": 1, "y": 2 }, // object add
            "c": [1, 9],             // element update + one removal
            "d": true                // key add
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
        assert!(!s.converged());
    }

    #[test]
    fn server_defaults_inside_list_items_are_not_drift() {
        let live = serde_json::json!({
            "containers": [{
                "name": "indexer",
                "image": "img:1",
                "terminationMessagePath": "/dev/termination-log",
                "ports": [{ "name": "mgmt", "containerPort": 8089, "protocol": "TCP" }]
            }]
        });
        let desired = serde_json::json!({
            "containers": [{ "name": "indexer", "image": "img:1", "ports": [{ "name": "mgmt", "containerPort": 8089 }] }]
        });
        let s = diff_summary(&desired, &live);
        assert!(s.converged(), "{:?}", s);
        assert_eq!(s.removes, 2);

        let bumped = serde_json::json!({ "containers": [{ "name": "indexer", "image": "img:2" }] });
        assert_eq!(diff_summary(&bumped, &live).updates, 1);
    }
}
