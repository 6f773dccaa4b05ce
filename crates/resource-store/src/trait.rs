//! ResourceStore trait for mocking
//!
//! This trait abstracts the Kubernetes API so the reconciler can be unit
//! tested against an in-memory store. `KubeStore` implements it for real
//! clusters; `MockResourceStore` (feature `test-util`) implements it in memory.

use crate::error::StoreError;
use crate::models::{ManagedObject, ObjectKey, PatchSet, ResourceKind};
use crds::{Lolcow, LolcowStatus};

/// Operations the reconciler needs from the resource store
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ResourceStoreTrait: Send + Sync {
    /// Fetch the desired-state object
    async fn get_lolcow(&self, key: &ObjectKey) -> Result<Lolcow, StoreError>;

    /// Write `status` through the status subresource. When `expected_version`
    /// is set, the write fails with `Conflict` if the object has moved on.
    async fn patch_lolcow_status(
        &self,
        key: &ObjectKey,
        status: &LolcowStatus,
        expected_version: Option<&str>,
    ) -> Result<Lolcow, StoreError>;

    /// Fetch a managed object
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<ManagedObject, StoreError>;

    /// Create a managed object. Fails with `Conflict` if it already exists.
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError>;

    /// Apply field-level changes to a managed object, version-checked when
    /// `expected_version` is set
    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &PatchSet,
        expected_version: Option<&str>,
    ) -> Result<ManagedObject, StoreError>;

    /// Delete a managed object (background propagation)
    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError>;
}
