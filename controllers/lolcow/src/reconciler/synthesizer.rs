//! Desired-state synthesis.
//!
//! Maps a `Lolcow` to the Deployment and Service that should exist for it.
//! Everything here is a pure function of the Lolcow and the configured
//! settings, so two invocations for the same input produce identical targets.

use crate::config::EndpointType;
use crate::error::ControllerError;
use crds::{Lolcow, LolcowSpec, NODE_PORT_MAX, NODE_PORT_MIN};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use resource_store::{ManagedObject, ObjectKey, ResourceKind};
use std::collections::BTreeMap;

/// Name of the greeting container inside the workload
pub const CONTAINER_NAME: &str = "lolcow";
/// Port the greeting server listens on inside the pod
pub const CONTAINER_PORT: i32 = 8080;
/// Port the Service exposes inside the cluster
pub const SERVICE_PORT: i32 = 80;
/// Replica count of the workload
pub const REPLICAS: i32 = 1;
/// Value of the `app.kubernetes.io/managed-by` label
pub const MANAGED_BY: &str = "lolcow-controller";

const PORT_NAME: &str = "http";

/// Configuration inputs of the synthesizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisSettings {
    pub image: String,
    pub endpoint_type: EndpointType,
}

/// Canonical targets for one Lolcow
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub workload: Deployment,
    pub endpoint: Service,
}

impl Targets {
    /// Target of the given kind
    pub fn get(&self, kind: ResourceKind) -> ManagedObject {
        match kind {
            ResourceKind::Workload => ManagedObject::Workload(self.workload.clone()),
            ResourceKind::Endpoint => ManagedObject::Endpoint(self.endpoint.clone()),
        }
    }
}

/// Rejects declarations that cannot be realised
pub fn validate(spec: &LolcowSpec) -> Result<(), ControllerError> {
    if spec.greeting.trim().is_empty() {
        return Err(ControllerError::Invalid("spec.greeting must not be empty".to_string()));
    }
    if spec.port != 0 && !(NODE_PORT_MIN..=NODE_PORT_MAX).contains(&spec.port) {
        return Err(ControllerError::Invalid(format!(
            "spec.port {} is outside the NodePort range {}-{}",
            spec.port, NODE_PORT_MIN, NODE_PORT_MAX
        )));
    }
    Ok(())
}

/// Identity of the managed object of `kind` for the Lolcow at `owner`.
///
/// Both managed objects share the Lolcow's name and namespace.
pub fn derived_key(_kind: ResourceKind, owner: &ObjectKey) -> ObjectKey {
    owner.clone()
}

fn lolcow_key(lolcow: &Lolcow) -> Result<ObjectKey, ControllerError> {
    ObjectKey::from_resource(lolcow)
        .ok_or_else(|| ControllerError::MissingMetadata("Lolcow has no name".to_string()))
}

pub fn workload_key(lolcow: &Lolcow) -> Result<ObjectKey, ControllerError> {
    Ok(derived_key(ResourceKind::Workload, &lolcow_key(lolcow)?))
}

pub fn endpoint_key(lolcow: &Lolcow) -> Result<ObjectKey, ControllerError> {
    Ok(derived_key(ResourceKind::Endpoint, &lolcow_key(lolcow)?))
}

/// Labels carried by both managed objects and the pod template
pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "lolcow".to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        ("tier".to_string(), "backend".to_string()),
    ])
}

/// Launch command of the greeting container; the greeting is the last argument
pub fn command(greeting: &str) -> Vec<String> {
    vec!["python3".to_string(), "/code/run.py".to_string(), greeting.to_string()]
}

/// Port list of the endpoint
pub fn service_ports(node_port: i32) -> Vec<ServicePort> {
    vec![ServicePort {
        name: Some(PORT_NAME.to_string()),
        protocol: Some("TCP".to_string()),
        port: SERVICE_PORT,
        target_port: Some(IntOrString::Int(CONTAINER_PORT)),
        node_port: Some(node_port),
        ..Default::default()
    }]
}

fn owned_metadata(lolcow: &Lolcow, key: &ObjectKey) -> Result<ObjectMeta, ControllerError> {
    let owner = lolcow.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::MissingMetadata(format!("Lolcow {} has no uid, cannot own objects", key))
    })?;
    Ok(ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        labels: Some(labels(&key.name)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

/// Builds the target workload and endpoint for `lolcow`
pub fn synthesize(lolcow: &Lolcow, settings: &SynthesisSettings) -> Result<Targets, ControllerError> {
    let workload_key = workload_key(lolcow)?;
    let endpoint_key = endpoint_key(lolcow)?;
    let pod_labels = labels(&workload_key.name);

    let workload = Deployment {
        metadata: owned_metadata(lolcow, &workload_key)?,
        spec: Some(DeploymentSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(settings.image.clone()),
                        command: Some(command(&lolcow.spec.greeting)),
                        ports: Some(vec![ContainerPort {
                            name: Some(PORT_NAME.to_string()),
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(vec![EnvVar {
                            name: "PORT".to_string(),
                            value: Some(CONTAINER_PORT.to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let endpoint = Service {
        metadata: owned_metadata(lolcow, &endpoint_key)?,
        spec: Some(ServiceSpec {
            type_: Some(settings.endpoint_type.as_str().to_string()),
            selector: Some(pod_labels),
            ports: Some(service_ports(lolcow.spec.effective_port())),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Targets { workload, endpoint })
}
