//! ixo kubehub: kube client bootstrap, IndexerCluster/StatefulSet access and watch wiring.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    Client,
};
use ixo_core::{ClusterObject, ObjectKey, GROUP, KIND, PLURAL, VERSION};
use tracing::debug;

pub mod crd;
pub mod events;
pub mod mock;

pub use events::{EventSource, WatchItem};
pub use mock::{HubStats, MemoryHub};

/// Build a client from kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster env)")
}

/// Dynamic resource descriptor for IndexerCluster.
pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
}

/// Project a fetched IndexerCluster into the loop's object model. Objects without
/// name or namespace are not reconcilable and yield `None`.
pub fn cluster_from(obj: &DynamicObject) -> Option<ClusterObject> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone()?;
    Some(ClusterObject {
        api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
        kind: obj.types.as_ref().map(|t| t.kind.clone()),
        key: ObjectKey::new(namespace, name),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        generation: obj.metadata.generation,
        spec: obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null),
        status: obj.data.get("status").cloned(),
    })
}

/// Build a `kube::Error::Api` the way the API server reports failures.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message: message.into(), reason: reason.into(), code })
}

/// HTTP status of an API error, if the error came from the server.
pub fn error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Read access the reconciler needs.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// `Ok(None)` when the IndexerCluster no longer exists.
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, kube::Error>;
}

/// Everything ApplyState touches. Writes carry resource versions where the API supports it.
#[async_trait]
pub trait ClusterApi: ClusterReader {
    async fn patch_cluster_status(&self, key: &ObjectKey, status: &serde_json::Value) -> Result<(), kube::Error>;
    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, kube::Error>;
    async fn create_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error>;
    /// Full replace; fails with 409 when `metadata.resourceVersion` is stale.
    async fn replace_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error>;
}

/// API-server backed implementation.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    ar: ApiResource,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, ar: api_resource() }
    }

    fn clusters(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &self.ar)
    }

    fn workloads(&self, ns: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl ClusterReader for KubeHub {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, kube::Error> {
        let obj = self.clusters(&key.namespace).get_opt(&key.name).await?;
        Ok(obj.as_ref().and_then(cluster_from))
    }
}

#[async_trait]
impl ClusterApi for KubeHub {
    async fn patch_cluster_status(&self, key: &ObjectKey, status: &serde_json::Value) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "status": status });
        self.clusters(&key.namespace).patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        debug!(key = %key, "status patched");
        Ok(())
    }

    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, kube::Error> {
        self.workloads(&key.namespace).get_opt(&key.name).await
    }

    async fn create_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        self.workloads(&key.namespace).create(&PostParams::default(), workload).await
    }

    async fn replace_workload(&self, key: &ObjectKey, workload: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        self.workloads(&key.namespace).replace(&key.name, &PostParams::default(), workload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_from_projects_payload() {
        let obj = DynamicObject::new("foo", &api_resource())
            .within("ns")
            .data(serde_json::json!({ "spec": { "replicas": 3 }, "status": { "phase": "Ready" } }));
        let c = cluster_from(&obj).unwrap();
        assert_eq!(c.key, ObjectKey::new("ns", "foo"));
        assert_eq!(c.api_version.as_deref(), Some("ixo.dev/v1alpha1"));
        assert_eq!(c.kind.as_deref(), Some("IndexerCluster"));
        assert_eq!(c.spec["replicas"], 3);
        assert_eq!(c.status.unwrap()["phase"], "Ready");
    }

    #[test]
    fn cluster_from_requires_namespace() {
        let obj = DynamicObject::new("foo", &api_resource());
        assert!(cluster_from(&obj).is_none());
    }

    #[test]
    fn cluster_from_tolerates_missing_spec_and_types() {
        let mut obj = DynamicObject::new("foo", &api_resource()).within("ns");
        obj.types = None;
        let c = cluster_from(&obj).unwrap();
        assert!(c.spec.is_null());
        assert!(c.api_version.is_none());
        assert!(c.status.is_none());
    }

    #[test]
    fn api_error_carries_code() {
        let e = api_error(409, "Conflict", "stale");
        assert_eq!(error_code(&e), Some(409));
    }
}
