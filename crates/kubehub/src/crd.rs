//! IndexerCluster CustomResourceDefinition manifest.

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use ixo_core::{GROUP, KIND, PLURAL, VERSION};

/// Render the CRD served by this operator, with the status subresource enabled.
pub fn indexer_cluster_crd() -> Result<CustomResourceDefinition> {
    let manifest = serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{}.{}", PLURAL, GROUP) },
        "spec": {
            "group": GROUP,
            "scope": "Namespaced",
            "names": {
                "kind": KIND,
                "plural": PLURAL,
                "singular": KIND.to_lowercase(),
                "shortNames": ["idxc"],
            },
            "versions": [{
                "name": VERSION,
                "served": true,
                "storage": true,
                "subresources": { "status": {} },
                "additionalPrinterColumns": [
                    { "name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas" },
                    { "name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas" },
                    { "name": "Phase", "type": "string", "jsonPath": ".status.phase" },
                    { "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" },
                ],
                "schema": { "openAPIV3Schema": {
                    "type": "object",
                    "properties": {
                        "spec": {
                            "type": "object",
                            "properties": {
                                "replicas": { "type": "integer", "format": "int32", "minimum": 0 },
                                "image": { "type": "string" },
                                "imagePullPolicy": { "type": "string", "enum": ["Always", "IfNotPresent", "Never"] },
                                "labels": { "type": "object", "additionalProperties": { "type": "string" } },
                            },
                        },
                        "status": { "type": "object", "x-kubernetes-preserve-unknown-fields": true },
                    },
                }},
            }],
        },
    });
    serde_json::from_value(manifest).context("building IndexerCluster CRD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_names_and_status_subresource() {
        let crd = indexer_cluster_crd().unwrap();
        assert_eq!(crd.metadata.name.as_deref(), Some("indexerclusters.ixo.dev"));
        assert_eq!(crd.spec.group, "ixo.dev");
        assert_eq!(crd.spec.names.kind, "IndexerCluster");
        let v = &crd.spec.versions[0];
        assert_eq!(v.name, "v1alpha1");
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }
}
