//! Mock resource store for unit testing
//!
//! In-memory implementation of `ResourceStoreTrait`. It keeps a log of every
//! write the controller issues, bumps `resourceVersion` on each mutation and
//! enforces version-checked writes, so tests can assert on idempotence and
//! conflict handling without a cluster.

use crate::error::StoreError;
use crate::models::{FieldChange, ManagedObject, ObjectKey, PatchSet, ResourceKind};
use crate::store_trait::ResourceStoreTrait;
use crds::{Lolcow, LolcowSpec, LolcowStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Store operations, used to tag writes and injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    GetLolcow,
    PatchLolcowStatus,
    Get,
    Create,
    Patch,
    Delete,
}

/// Error to return from an injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    Conflict,
    Transient,
    Forbidden,
}

impl MockFailure {
    fn into_error(self, context: String) -> StoreError {
        match self {
            MockFailure::NotFound => StoreError::NotFound(context),
            MockFailure::Conflict => StoreError::Conflict(context),
            MockFailure::Transient => StoreError::Transient(context),
            MockFailure::Forbidden => StoreError::Forbidden(context),
        }
    }
}

/// One write issued through the trait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: MockOp,
    /// `None` for writes to the Lolcow itself
    pub kind: Option<ResourceKind>,
    pub key: ObjectKey,
}

#[derive(Default)]
struct MockState {
    lolcows: BTreeMap<ObjectKey, Lolcow>,
    workloads: BTreeMap<ObjectKey, Deployment>,
    endpoints: BTreeMap<ObjectKey, Service>,
    next_version: u64,
    writes: Vec<WriteRecord>,
    calls: Vec<MockOp>,
    failures: Vec<(MockOp, Option<ResourceKind>, MockFailure)>,
}

impl MockState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Removes and returns the first injected failure matching the call
    fn take_failure(&mut self, op: MockOp, kind: Option<ResourceKind>) -> Option<MockFailure> {
        let pos = self
            .failures
            .iter()
            .position(|(o, k, _)| *o == op && (k.is_none() || *k == kind))?;
        Some(self.failures.remove(pos).2)
    }
}

/// Mock resource store for testing
#[derive(Clone, Default)]
pub struct MockResourceStore {
    state: Arc<Mutex<MockState>>,
}

impl MockResourceStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a Lolcow as an external client would. A uid is assigned if missing.
    pub fn insert_lolcow(&self, mut lolcow: Lolcow) -> Lolcow {
        let mut state = self.state();
        let key = ObjectKey::from_resource(&lolcow).unwrap_or_else(|| ObjectKey::new("default", ""));
        if lolcow.metadata.uid.is_none() {
            lolcow.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        lolcow.metadata.namespace = Some(key.namespace.clone());
        lolcow.metadata.resource_version = Some(state.bump_version());
        state.lolcows.insert(key, lolcow.clone());
        lolcow
    }

    /// Mutate a Lolcow spec as an external client would
    pub fn update_lolcow_spec(&self, key: &ObjectKey, f: impl FnOnce(&mut LolcowSpec)) {
        let mut state = self.state();
        let version = state.bump_version();
        if let Some(lolcow) = state.lolcows.get_mut(key) {
            f(&mut lolcow.spec);
            lolcow.metadata.resource_version = Some(version);
        }
    }

    /// Remove a Lolcow without cascading to its dependents, as if garbage
    /// collection has not run yet
    pub fn remove_lolcow(&self, key: &ObjectKey) -> Option<Lolcow> {
        self.state().lolcows.remove(key)
    }

    /// Current copy of a Lolcow
    pub fn lolcow(&self, key: &ObjectKey) -> Option<Lolcow> {
        self.state().lolcows.get(key).cloned()
    }

    /// Add a managed object as an external actor would
    pub fn insert_object(&self, mut object: ManagedObject) {
        let mut state = self.state();
        let Some(key) = object.key() else { return };
        let meta = object.metadata_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.namespace = Some(key.namespace.clone());
        meta.resource_version = Some(state.bump_version());
        match object {
            ManagedObject::Workload(d) => {
                state.workloads.insert(key, d);
            }
            ManagedObject::Endpoint(s) => {
                state.endpoints.insert(key, s);
            }
        }
    }

    /// Mutate a managed object as an external actor would (drift)
    pub fn mutate_object(&self, kind: ResourceKind, key: &ObjectKey, f: impl FnOnce(&mut ManagedObject)) {
        let Some(mut object) = self.object(kind, key) else { return };
        f(&mut object);
        let mut state = self.state();
        object.metadata_mut().resource_version = Some(state.bump_version());
        match object {
            ManagedObject::Workload(d) => {
                state.workloads.insert(key.clone(), d);
            }
            ManagedObject::Endpoint(s) => {
                state.endpoints.insert(key.clone(), s);
            }
        }
    }

    /// Remove a managed object as an external actor would, bypassing the write log
    pub fn remove_object(&self, kind: ResourceKind, key: &ObjectKey) -> Option<ManagedObject> {
        let mut state = self.state();
        match kind {
            ResourceKind::Workload => state.workloads.remove(key).map(ManagedObject::Workload),
            ResourceKind::Endpoint => state.endpoints.remove(key).map(ManagedObject::Endpoint),
        }
    }

    /// Current copy of a managed object
    pub fn object(&self, kind: ResourceKind, key: &ObjectKey) -> Option<ManagedObject> {
        let state = self.state();
        match kind {
            ResourceKind::Workload => state.workloads.get(key).cloned().map(ManagedObject::Workload),
            ResourceKind::Endpoint => state.endpoints.get(key).cloned().map(ManagedObject::Endpoint),
        }
    }

    /// Every write issued through the trait, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Every trait call, oldest first (reads included)
    pub fn calls(&self) -> Vec<MockOp> {
        self.state().calls.clone()
    }

    /// Forget recorded writes and calls
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.writes.clear();
        state.calls.clear();
    }

    /// Make the next matching call fail. `kind = None` matches any kind.
    pub fn fail_next(&self, op: MockOp, kind: Option<ResourceKind>, failure: MockFailure) {
        self.state().failures.push((op, kind, failure));
    }

    fn begin(&self, state: &mut MockState, op: MockOp, kind: Option<ResourceKind>, key: &ObjectKey) -> Result<(), StoreError> {
        state.calls.push(op);
        match state.take_failure(op, kind) {
            Some(failure) => Err(failure.into_error(format!("injected {:?} failure for {}", op, key))),
            None => Ok(()),
        }
    }
}

fn check_version(actual: Option<&str>, expected: Option<&str>, key: &ObjectKey) -> Result<(), StoreError> {
    match expected {
        Some(expected) if actual != Some(expected) => Err(StoreError::Conflict(format!(
            "{}: resourceVersion {} is stale (current {})",
            key,
            expected,
            actual.unwrap_or("<none>")
        ))),
        _ => Ok(()),
    }
}

/// Strategic merge keys containers by name: a missing entry is appended
fn named_container<'a>(containers: &'a mut Vec<Container>, name: &str) -> &'a mut Container {
    let pos = match containers.iter().position(|c| c.name == name) {
        Some(pos) => pos,
        None => {
            containers.push(Container {
                name: name.to_string(),
                ..Default::default()
            });
            containers.len() - 1
        }
    };
    &mut containers[pos]
}

fn apply_workload_change(deployment: &mut Deployment, change: &FieldChange) {
    let spec = deployment.spec.get_or_insert_with(Default::default);
    match change {
        FieldChange::Replicas(n) => spec.replicas = Some(*n),
        FieldChange::PodLabels(labels) => {
            spec.template.metadata.get_or_insert_with(Default::default).labels = Some(labels.clone());
        }
        FieldChange::ContainerCommand { container, command } => {
            let pod = spec.template.spec.get_or_insert_with(Default::default);
            named_container(&mut pod.containers, container).command = Some(command.clone());
        }
        FieldChange::ContainerImage { container, image } => {
            let pod = spec.template.spec.get_or_insert_with(Default::default);
            named_container(&mut pod.containers, container).image = Some(image.clone());
        }
        FieldChange::Selector(_) | FieldChange::Ports(_) | FieldChange::ServiceType(_) => {}
    }
}

fn apply_endpoint_change(service: &mut Service, change: &FieldChange) {
    let spec = service.spec.get_or_insert_with(Default::default);
    match change {
        FieldChange::Selector(selector) => spec.selector = Some(selector.clone()),
        FieldChange::Ports(ports) => spec.ports = Some(ports.clone()),
        FieldChange::ServiceType(t) => spec.type_ = Some(t.clone()),
        FieldChange::Replicas(_)
        | FieldChange::PodLabels(_)
        | FieldChange::ContainerCommand { .. }
        | FieldChange::ContainerImage { .. } => {}
    }
}

#[async_trait::async_trait]
impl ResourceStoreTrait for MockResourceStore {
    async fn get_lolcow(&self, key: &ObjectKey) -> Result<Lolcow, StoreError> {
        let mut state = self.state();
        self.begin(&mut state, MockOp::GetLolcow, None, key)?;
        state
            .lolcows
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("get Lolcow {}", key)))
    }

    async fn patch_lolcow_status(
        &self,
        key: &ObjectKey,
        status: &LolcowStatus,
        expected_version: Option<&str>,
    ) -> Result<Lolcow, StoreError> {
        let mut state = self.state();
        self.begin(&mut state, MockOp::PatchLolcowStatus, None, key)?;
        let version = state.bump_version();
        let lolcow = state
            .lolcows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("patch Lolcow {} status", key)))?;
        check_version(lolcow.metadata.resource_version.as_deref(), expected_version, key)?;
        lolcow.status = Some(status.clone());
        lolcow.metadata.resource_version = Some(version);
        let updated = lolcow.clone();
        state.writes.push(WriteRecord {
            op: MockOp::PatchLolcowStatus,
            kind: None,
            key: key.clone(),
        });
        Ok(updated)
    }

    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<ManagedObject, StoreError> {
        let mut state = self.state();
        self.begin(&mut state, MockOp::Get, Some(kind), key)?;
        let found = match kind {
            ResourceKind::Workload => state.workloads.get(key).cloned().map(ManagedObject::Workload),
            ResourceKind::Endpoint => state.endpoints.get(key).cloned().map(ManagedObject::Endpoint),
        };
        found.ok_or_else(|| StoreError::NotFound(format!("get {} {}", kind, key)))
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = object
            .key()
            .ok_or_else(|| StoreError::Invalid(format!("{} without name cannot be created", object.kind())))?;
        let kind = object.kind();
        let mut state = self.state();
        self.begin(&mut state, MockOp::Create, Some(kind), &key)?;
        let exists = match kind {
            ResourceKind::Workload => state.workloads.contains_key(&key),
            ResourceKind::Endpoint => state.endpoints.contains_key(&key),
        };
        if exists {
            return Err(StoreError::Conflict(format!("create {} {}: already exists", kind, key)));
        }

        let mut created = object.clone();
        let version = state.bump_version();
        let meta = created.metadata_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(version);
        match &created {
            ManagedObject::Workload(d) => {
                state.workloads.insert(key.clone(), d.clone());
            }
            ManagedObject::Endpoint(s) => {
                state.endpoints.insert(key.clone(), s.clone());
            }
        }
        state.writes.push(WriteRecord {
            op: MockOp::Create,
            kind: Some(kind),
            key,
        });
        Ok(created)
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &PatchSet,
        expected_version: Option<&str>,
    ) -> Result<ManagedObject, StoreError> {
        let kind = patch.kind();
        let mut state = self.state();
        self.begin(&mut state, MockOp::Patch, Some(kind), key)?;
        let version = state.bump_version();
        let not_found = || StoreError::NotFound(format!("patch {} {}", kind, key));
        let updated = match kind {
            ResourceKind::Workload => {
                let deployment = state.workloads.get_mut(key).ok_or_else(not_found)?;
                check_version(deployment.metadata.resource_version.as_deref(), expected_version, key)?;
                for change in patch.changes() {
                    apply_workload_change(deployment, change);
                }
                deployment.metadata.resource_version = Some(version);
                ManagedObject::Workload(deployment.clone())
            }
            ResourceKind::Endpoint => {
                let service = state.endpoints.get_mut(key).ok_or_else(not_found)?;
                check_version(service.metadata.resource_version.as_deref(), expected_version, key)?;
                for change in patch.changes() {
                    apply_endpoint_change(service, change);
                }
                service.metadata.resource_version = Some(version);
                ManagedObject::Endpoint(service.clone())
            }
        };
        state.writes.push(WriteRecord {
            op: MockOp::Patch,
            kind: Some(kind),
            key: key.clone(),
        });
        Ok(updated)
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state();
        self.begin(&mut state, MockOp::Delete, Some(kind), key)?;
        let removed = match kind {
            ResourceKind::Workload => state.workloads.remove(key).is_some(),
            ResourceKind::Endpoint => state.endpoints.remove(key).is_some(),
        };
        if !removed {
            return Err(StoreError::NotFound(format!("delete {} {}", kind, key)));
        }
        state.writes.push(WriteRecord {
            op: MockOp::Delete,
            kind: Some(kind),
            key: key.clone(),
        });
        Ok(())
    }
}
