//! Owned-field diffing.
//!
//! Only fields the controller sets are compared. Server-populated fields
//! (status, clusterIP, defaulted pod spec fields, annotations, other
//! containers) never produce a change, so an object that merely went through
//! API server defaulting is reported as converged.

use super::synthesizer::CONTAINER_NAME;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use resource_store::{FieldChange, ManagedObject, PatchSet, ResourceKind};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Minimal change set that brings `actual` to `target` on owned fields
pub fn diff(target: &ManagedObject, actual: &ManagedObject) -> PatchSet {
    match (target, actual) {
        (ManagedObject::Workload(target), ManagedObject::Workload(actual)) => diff_workload(target, actual),
        (ManagedObject::Endpoint(target), ManagedObject::Endpoint(actual)) => diff_endpoint(target, actual),
        _ => {
            warn!(
                "Cannot diff {} against {}: kinds differ",
                target.kind(),
                actual.kind()
            );
            PatchSet::new(target.kind())
        }
    }
}

fn pod_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment.spec.as_ref()?.template.metadata.as_ref()?.labels.as_ref()
}

fn named_container<'a>(deployment: &'a Deployment, name: &str) -> Option<&'a Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name)
}

/// Workload owned fields: replicas, pod labels, the greeting container's
/// command and image
pub fn diff_workload(target: &Deployment, actual: &Deployment) -> PatchSet {
    let mut patch = PatchSet::new(ResourceKind::Workload);

    let target_replicas = target.spec.as_ref().and_then(|s| s.replicas);
    let actual_replicas = actual.spec.as_ref().and_then(|s| s.replicas);
    if let Some(replicas) = target_replicas {
        if actual_replicas != Some(replicas) {
            debug!("Replicas changed: {:?} -> {}", actual_replicas, replicas);
            patch.push(FieldChange::Replicas(replicas));
        }
    }

    if let Some(labels) = pod_labels(target) {
        if pod_labels(actual) != Some(labels) {
            debug!("Pod labels changed: {:?} -> {:?}", pod_labels(actual), labels);
            patch.push(FieldChange::PodLabels(labels.clone()));
        }
    }

    if let Some(wanted) = named_container(target, CONTAINER_NAME) {
        let current = named_container(actual, CONTAINER_NAME);
        if current.is_none() {
            debug!("Container {} missing from workload", CONTAINER_NAME);
        }

        let current_command = current.and_then(|c| c.command.as_ref());
        if let Some(command) = wanted.command.as_ref() {
            if current_command != Some(command) {
                debug!("Command changed: {:?} -> {:?}", current_command, command);
                patch.push(FieldChange::ContainerCommand {
                    container: CONTAINER_NAME.to_string(),
                    command: command.clone(),
                });
            }
        }

        let current_image = current.and_then(|c| c.image.as_ref());
        if let Some(image) = wanted.image.as_ref() {
            if current_image != Some(image) {
                debug!("Image changed: {:?} -> {}", current_image, image);
                patch.push(FieldChange::ContainerImage {
                    container: CONTAINER_NAME.to_string(),
                    image: image.clone(),
                });
            }
        }
    }

    patch
}

/// The part of a `ServicePort` the controller owns
#[derive(Debug, PartialEq)]
struct OwnedPort<'a> {
    name: Option<&'a str>,
    port: i32,
    target_port: Option<&'a IntOrString>,
    node_port: Option<i32>,
    protocol: &'a str,
}

impl<'a> From<&'a ServicePort> for OwnedPort<'a> {
    fn from(port: &'a ServicePort) -> Self {
        Self {
            name: port.name.as_deref(),
            port: port.port,
            target_port: port.target_port.as_ref(),
            node_port: port.node_port,
            // the API server defaults an unset protocol to TCP
            protocol: port.protocol.as_deref().unwrap_or("TCP"),
        }
    }
}

fn ports_match(target: &[ServicePort], actual: &[ServicePort]) -> bool {
    target.len() == actual.len()
        && target
            .iter()
            .zip(actual)
            .all(|(t, a)| OwnedPort::from(t) == OwnedPort::from(a))
}

/// Endpoint owned fields: selector, ports and exposure type
pub fn diff_endpoint(target: &Service, actual: &Service) -> PatchSet {
    let mut patch = PatchSet::new(ResourceKind::Endpoint);
    let Some(wanted) = target.spec.as_ref() else {
        return patch;
    };
    let current = actual.spec.as_ref();

    if let Some(selector) = wanted.selector.as_ref() {
        let current_selector = current.and_then(|s| s.selector.as_ref());
        if current_selector != Some(selector) {
            debug!("Selector changed: {:?} -> {:?}", current_selector, selector);
            patch.push(FieldChange::Selector(selector.clone()));
        }
    }

    if let Some(ports) = wanted.ports.as_ref() {
        let current_ports = current.and_then(|s| s.ports.as_deref()).unwrap_or_default();
        if !ports_match(ports, current_ports) {
            debug!("Ports changed: {:?} -> {:?}", current_ports, ports);
            patch.push(FieldChange::Ports(ports.clone()));
        }
    }

    if let Some(service_type) = wanted.type_.as_ref() {
        // unset means ClusterIP
        let current_type = current.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");
        if current_type != service_type {
            debug!("Service type changed: {} -> {}", current_type, service_type);
            patch.push(FieldChange::ServiceType(service_type.clone()));
        }
    }

    patch
}
