//! Kubernetes-backed resource store

use crate::error::StoreError;
use crate::models::{ManagedObject, ObjectKey, PatchSet, ResourceKind};
use crate::store_trait::ResourceStoreTrait;
use crds::{Lolcow, LolcowStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{Value, json};
use tracing::debug;

/// Resource store talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Creates a store on top of an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn lolcows(&self, namespace: &str) -> Api<Lolcow> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Builds a merge patch for the status subresource.
///
/// Fields are written explicitly (including nulls) so that clearing an
/// `error` actually removes it; a serialized `LolcowStatus` would skip the
/// `None`s and leave stale values behind.
pub(crate) fn lolcow_status_patch(status: &LolcowStatus, expected_version: Option<&str>) -> Value {
    let mut patch = json!({
        "status": {
            "appliedGreeting": status.applied_greeting,
            "appliedPort": status.applied_port,
            "state": status.state.as_str(),
            "error": status.error,
            "lastApplied": status.last_applied,
        }
    });
    if let Some(version) = expected_version {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

#[async_trait::async_trait]
impl ResourceStoreTrait for KubeStore {
    async fn get_lolcow(&self, key: &ObjectKey) -> Result<Lolcow, StoreError> {
        self.lolcows(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("get Lolcow {}", key)))
    }

    async fn patch_lolcow_status(
        &self,
        key: &ObjectKey,
        status: &LolcowStatus,
        expected_version: Option<&str>,
    ) -> Result<Lolcow, StoreError> {
        let patch = lolcow_status_patch(status, expected_version);
        debug!("Patching Lolcow {} status: {}", key, patch);
        self.lolcows(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("patch Lolcow {} status", key)))
    }

    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<ManagedObject, StoreError> {
        let context = format!("get {} {}", kind, key);
        match kind {
            ResourceKind::Workload => self
                .deployments(&key.namespace)
                .get(&key.name)
                .await
                .map(ManagedObject::Workload)
                .map_err(|e| StoreError::from_kube(e, &context)),
            ResourceKind::Endpoint => self
                .services(&key.namespace)
                .get(&key.name)
                .await
                .map(ManagedObject::Endpoint)
                .map_err(|e| StoreError::from_kube(e, &context)),
        }
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = object.key().ok_or_else(|| {
            StoreError::Invalid(format!("{} without name cannot be created", object.kind()))
        })?;
        let context = format!("create {} {}", object.kind(), key);
        let pp = PostParams::default();
        match object {
            ManagedObject::Workload(deployment) => self
                .deployments(&key.namespace)
                .create(&pp, deployment)
                .await
                .map(ManagedObject::Workload)
                .map_err(|e| StoreError::from_kube(e, &context)),
            ManagedObject::Endpoint(service) => self
                .services(&key.namespace)
                .create(&pp, service)
                .await
                .map(ManagedObject::Endpoint)
                .map_err(|e| StoreError::from_kube(e, &context)),
        }
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &PatchSet,
        expected_version: Option<&str>,
    ) -> Result<ManagedObject, StoreError> {
        let body = patch.to_patch_body(expected_version)?;
        let context = format!("patch {} {}", patch.kind(), key);
        debug!("Patching {} {}: {}", patch.kind(), key, body);
        let pp = PatchParams::default();
        match patch.kind() {
            ResourceKind::Workload => self
                .deployments(&key.namespace)
                .patch(&key.name, &pp, &Patch::Strategic(&body))
                .await
                .map(ManagedObject::Workload)
                .map_err(|e| StoreError::from_kube(e, &context)),
            ResourceKind::Endpoint => self
                .services(&key.namespace)
                .patch(&key.name, &pp, &Patch::Strategic(&body))
                .await
                .map(ManagedObject::Endpoint)
                .map_err(|e| StoreError::from_kube(e, &context)),
        }
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
        let context = format!("delete {} {}", kind, key);
        let dp = DeleteParams::background();
        match kind {
            ResourceKind::Workload => self
                .deployments(&key.namespace)
                .delete(&key.name, &dp)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::from_kube(e, &context)),
            ResourceKind::Endpoint => self
                .services(&key.namespace)
                .delete(&key.name, &dp)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::from_kube(e, &context)),
        }
    }
}
