//! Controller configuration
//!
//! Everything is read from environment variables so the controller can be
//! configured from its Deployment manifest.

use crate::error::ControllerError;
use crate::subscription::{EventType, SubscriptionFilter};
use resource_store::ResourceKind;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default image for the greeting workload
pub const DEFAULT_IMAGE: &str = "ghcr.io/rse-ops/lolcow:app-latest";

/// How the managed Service is exposed outside the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointType {
    /// Reachable on every node at `spec.port`
    #[default]
    NodePort,
    /// Cloud load balancer in front of the node port
    LoadBalancer,
}

impl EndpointType {
    /// Value of `Service.spec.type`
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointType::NodePort => "NodePort",
            EndpointType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nodeport" => Ok(EndpointType::NodePort),
            "loadbalancer" => Ok(EndpointType::LoadBalancer),
            other => Err(ControllerError::InvalidConfig(format!(
                "LOLCOW_ENDPOINT_TYPE must be NodePort or LoadBalancer, got '{}'",
                other
            ))),
        }
    }
}

/// Runtime configuration of the Lolcow Controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Container image of the greeting workload
    pub image: String,
    /// Service exposure
    pub endpoint_type: EndpointType,
    /// Delay before re-validating after a write
    pub requeue_after: Duration,
    /// First backoff step after a transient failure
    pub backoff_min: Duration,
    /// Backoff cap
    pub backoff_max: Duration,
    /// Maximum concurrent reconciles (different keys)
    pub concurrency: u16,
    /// Listen address of the probe/metrics server
    pub probe_addr: SocketAddr,
    /// Which owned-object events trigger a reconcile
    pub subscriptions: Vec<SubscriptionFilter>,
}

impl ControllerConfig {
    /// Loads configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());
        let image = lookup("LOLCOW_IMAGE")
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let endpoint_type = match lookup("LOLCOW_ENDPOINT_TYPE") {
            Some(value) => value.parse()?,
            None => EndpointType::default(),
        };

        let requeue_after = Duration::from_secs(parse_number(&lookup, "LOLCOW_REQUEUE_SECS", 5)?);
        let backoff_min = parse_number(&lookup, "LOLCOW_BACKOFF_MIN_SECS", 5)?;
        let backoff_max = parse_number(&lookup, "LOLCOW_BACKOFF_MAX_SECS", 300)?;
        if backoff_min == 0 || backoff_min > backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff bounds must satisfy 0 < min <= max, got {}..{}",
                backoff_min, backoff_max
            )));
        }

        let concurrency = parse_number(&lookup, "LOLCOW_CONCURRENCY", 4)?;
        let concurrency = u16::try_from(concurrency).map_err(|_| {
            ControllerError::InvalidConfig(format!("LOLCOW_CONCURRENCY out of range: {}", concurrency))
        })?;

        let probe_addr = match lookup("LOLCOW_PROBE_ADDR") {
            Some(addr) => addr.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("LOLCOW_PROBE_ADDR '{}' is not a socket address: {}", addr, e))
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8081)),
        };

        let subscriptions = vec![
            parse_subscription(&lookup, "LOLCOW_WORKLOAD_EVENTS", ResourceKind::Workload)?,
            parse_subscription(&lookup, "LOLCOW_ENDPOINT_EVENTS", ResourceKind::Endpoint)?,
        ];

        Ok(Self {
            namespace,
            image,
            endpoint_type,
            requeue_after,
            backoff_min: Duration::from_secs(backoff_min),
            backoff_max: Duration::from_secs(backoff_max),
            concurrency,
            probe_addr,
            subscriptions,
        })
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<u64, ControllerError> {
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{} must be a non-negative integer, got '{}'", name, value))
        }),
        None => Ok(default),
    }
}

fn parse_subscription(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    kind: ResourceKind,
) -> Result<SubscriptionFilter, ControllerError> {
    let Some(value) = lookup(name) else {
        return Ok(SubscriptionFilter::all(kind));
    };
    let events = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EventType>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SubscriptionFilter::new(kind, events))
}
