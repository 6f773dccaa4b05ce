//! Store data models
//!
//! Object identities, the closed set of managed kinds, and the field-level
//! patch representation shared by the controller and the store
//! implementations.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

/// Namespaced identity of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of an existing object. Objects without a name have no
    /// key; a missing namespace falls back to "default".
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        let name = meta.name.as_ref()?;
        let namespace = meta.namespace.as_deref().unwrap_or("default");
        Some(Self::new(namespace, name.as_str()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of object the controller manages on behalf of a Lolcow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// apps/v1 Deployment running the greeting container
    Workload,
    /// v1 Service exposing the workload
    Endpoint,
}

impl ResourceKind {
    /// Every managed kind, in reconcile order
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Workload, ResourceKind::Endpoint];

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Workload => "Deployment",
            ResourceKind::Endpoint => "Service",
        }
    }

    /// Short lowercase label for logs and metrics
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Workload => "workload",
            ResourceKind::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed object of one of the [`ResourceKind`]s
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Workload(Deployment),
    Endpoint(Service),
}

impl ManagedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedObject::Workload(_) => ResourceKind::Workload,
            ManagedObject::Endpoint(_) => ResourceKind::Endpoint,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::Workload(d) => &d.metadata,
            ManagedObject::Endpoint(s) => &s.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::Workload(d) => &mut d.metadata,
            ManagedObject::Endpoint(s) => &mut s.metadata,
        }
    }

    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            ManagedObject::Workload(d) => ObjectKey::from_resource(d),
            ManagedObject::Endpoint(s) => ObjectKey::from_resource(s),
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// The owner reference flagged `controller: true`, if any
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
    }

    /// Whether the controlling owner is the given object. `uid` is only
    /// compared when provided, so callers that only know the owner's name
    /// (orphan cleanup) can still match.
    pub fn is_controlled_by(&self, kind: &str, name: &str, uid: Option<&str>) -> bool {
        match self.controller_owner() {
            Some(owner) => {
                owner.kind == kind
                    && owner.name == name
                    && uid.is_none_or(|uid| owner.uid == uid)
            }
            None => false,
        }
    }
}

/// A single controller-owned field that differs between target and actual
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// `spec.replicas` of the workload
    Replicas(i32),
    /// `spec.template.metadata.labels` of the workload (full replacement)
    PodLabels(BTreeMap<String, String>),
    /// `command` of the named container
    ContainerCommand { container: String, command: Vec<String> },
    /// `image` of the named container
    ContainerImage { container: String, image: String },
    /// `spec.selector` of the endpoint (full replacement)
    Selector(BTreeMap<String, String>),
    /// `spec.ports` of the endpoint (full replacement)
    Ports(Vec<ServicePort>),
    /// `spec.type` of the endpoint
    ServiceType(String),
}

impl FieldChange {
    /// JSON path of the field, for logging
    pub fn field_path(&self) -> &'static str {
        match self {
            FieldChange::Replicas(_) => "spec.replicas",
            FieldChange::PodLabels(_) => "spec.template.metadata.labels",
            FieldChange::ContainerCommand { .. } => "spec.template.spec.containers[].command",
            FieldChange::ContainerImage { .. } => "spec.template.spec.containers[].image",
            FieldChange::Selector(_) => "spec.selector",
            FieldChange::Ports(_) => "spec.ports",
            FieldChange::ServiceType(_) => "spec.type",
        }
    }
}

/// Minimal set of field changes needed to bring one object to its target
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSet {
    kind: ResourceKind,
    changes: Vec<FieldChange>,
}

impl PatchSet {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            changes: Vec::new(),
        }
    }

    pub fn push(&mut self, change: FieldChange) {
        self.changes.push(change);
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Comma-separated field paths, for logging
    pub fn describe(&self) -> String {
        self.changes
            .iter()
            .map(FieldChange::field_path)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Renders a strategic-merge patch body.
    ///
    /// Owned maps and lists carry `$patch: replace` so the stored field ends
    /// up exactly equal to the target instead of being merged with stale
    /// entries. Containers are merged by name so only the owned container
    /// fields are touched. When `expected_version` is given it is sent as
    /// `metadata.resourceVersion`, which makes the API server reject the
    /// patch with 409 Conflict if the object changed in the meantime.
    pub fn to_patch_body(&self, expected_version: Option<&str>) -> Result<Value, serde_json::Error> {
        let mut body = json!({});
        if let Some(version) = expected_version {
            body["metadata"] = json!({ "resourceVersion": version });
        }

        // container name -> partial container object, in first-seen order
        let mut containers: Vec<(String, Map<String, Value>)> = Vec::new();
        let mut container_entry = |name: &str| -> usize {
            if let Some(pos) = containers.iter().position(|(n, _)| n == name) {
                return pos;
            }
            let mut entry = Map::new();
            entry.insert("name".to_string(), Value::String(name.to_string()));
            containers.push((name.to_string(), entry));
            containers.len() - 1
        };
        let mut container_fields: Vec<(usize, &'static str, Value)> = Vec::new();

        for change in &self.changes {
            match change {
                FieldChange::Replicas(n) => {
                    body["spec"]["replicas"] = json!(n);
                }
                FieldChange::PodLabels(labels) => {
                    body["spec"]["template"]["metadata"]["labels"] = replace_map(labels);
                }
                FieldChange::ContainerCommand { container, command } => {
                    let idx = container_entry(container);
                    container_fields.push((idx, "command", json!(command)));
                }
                FieldChange::ContainerImage { container, image } => {
                    let idx = container_entry(container);
                    container_fields.push((idx, "image", json!(image)));
                }
                FieldChange::Selector(selector) => {
                    body["spec"]["selector"] = replace_map(selector);
                }
                FieldChange::Ports(ports) => {
                    let mut list = vec![json!({ "$patch": "replace" })];
                    for port in ports {
                        list.push(serde_json::to_value(port)?);
                    }
                    body["spec"]["ports"] = Value::Array(list);
                }
                FieldChange::ServiceType(service_type) => {
                    body["spec"]["type"] = json!(service_type);
                }
            }
        }

        for (idx, field, value) in container_fields {
            if let Some((_, entry)) = containers.get_mut(idx) {
                entry.insert(field.to_string(), value);
            }
        }
        if !containers.is_empty() {
            body["spec"]["template"]["spec"]["containers"] = Value::Array(
                containers.into_iter().map(|(_, entry)| Value::Object(entry)).collect(),
            );
        }

        Ok(body)
    }
}

fn replace_map(map: &BTreeMap<String, String>) -> Value {
    let mut out = Map::new();
    out.insert("$patch".to_string(), Value::String("replace".to_string()));
    for (k, v) in map {
        out.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn owned_deployment(owner: &str, uid: &str) -> ManagedObject {
        ManagedObject::Workload(Deployment {
            metadata: ObjectMeta {
                name: Some("cow".to_string()),
                namespace: Some("farm".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "lolcow.microscaler.io/v1alpha1".to_string(),
                    kind: "Lolcow".to_string(),
                    name: owner.to_string(),
                    uid: uid.to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_object_key_display_and_default_namespace() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("cow".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ObjectKey::from_resource(&svc).unwrap();
        assert_eq!(key, ObjectKey::new("default", "cow"));
        assert_eq!(key.to_string(), "default/cow");

        assert!(ObjectKey::from_resource(&Service::default()).is_none());
    }

    #[test]
    fn test_is_controlled_by() {
        let obj = owned_deployment("cow", "uid-1");
        assert!(obj.is_controlled_by("Lolcow", "cow", Some("uid-1")));
        assert!(obj.is_controlled_by("Lolcow", "cow", None));
        assert!(!obj.is_controlled_by("Lolcow", "cow", Some("uid-2")));
        assert!(!obj.is_controlled_by("Lolcow", "other", None));
        assert!(!obj.is_controlled_by("Sheep", "cow", None));

        let bare = ManagedObject::Workload(Deployment::default());
        assert!(!bare.is_controlled_by("Lolcow", "cow", None));
    }

    #[test]
    fn test_workload_patch_body() {
        let mut patch = PatchSet::new(ResourceKind::Workload);
        patch.push(FieldChange::Replicas(1));
        patch.push(FieldChange::ContainerCommand {
            container: "lolcow".to_string(),
            command: vec!["python3".to_string(), "/code/run.py".to_string(), "G2".to_string()],
        });
        patch.push(FieldChange::ContainerImage {
            container: "lolcow".to_string(),
            image: "img:2".to_string(),
        });

        let body = patch.to_patch_body(Some("42")).unwrap();
        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["spec"]["replicas"], 1);
        let containers = body["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "lolcow");
        assert_eq!(containers[0]["command"][2], "G2");
        assert_eq!(containers[0]["image"], "img:2");
        assert_eq!(patch.describe(), "spec.replicas, spec.template.spec.containers[].command, spec.template.spec.containers[].image");
    }

    #[test]
    fn test_endpoint_patch_body_replaces_owned_collections() {
        let mut patch = PatchSet::new(ResourceKind::Endpoint);
        let selector = BTreeMap::from([("app".to_string(), "lolcow".to_string())]);
        patch.push(FieldChange::Selector(selector));
        patch.push(FieldChange::Ports(vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(IntOrString::Int(8080)),
            node_port: Some(30000),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]));

        let body = patch.to_patch_body(None).unwrap();
        assert!(body.get("metadata").is_none());
        assert_eq!(body["spec"]["selector"]["$patch"], "replace");
        assert_eq!(body["spec"]["selector"]["app"], "lolcow");
        let ports = body["spec"]["ports"].as_array().unwrap();
        assert_eq!(ports[0]["$patch"], "replace");
        assert_eq!(ports[1]["nodePort"], 30000);
        assert_eq!(ports[1]["targetPort"], 8080);
    }

    #[test]
    fn test_empty_patch_set() {
        let patch = PatchSet::new(ResourceKind::Endpoint);
        assert!(patch.is_empty());
        assert_eq!(patch.len(), 0);
        assert_eq!(patch.kind(), ResourceKind::Endpoint);
    }
}
