//! Lolcow CRD
//!
//! Declares a greeting-serving workload. The controller realises each
//! `Lolcow` as a single-replica Deployment plus a Service exposing it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by all Lolcow resources
pub const LOLCOW_API_GROUP: &str = "lolcow.microscaler.io";

/// Externally reachable port used when `spec.port` is left unset (0)
pub const DEFAULT_NODE_PORT: i32 = 30685;

/// Lowest port accepted for `spec.port` (Kubernetes default NodePort range)
pub const NODE_PORT_MIN: i32 = 30000;

/// Highest port accepted for `spec.port` (Kubernetes default NodePort range)
pub const NODE_PORT_MAX: i32 = 32767;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "lolcow.microscaler.io",
    version = "v1alpha1",
    kind = "Lolcow",
    namespaced,
    status = "LolcowStatus",
    shortname = "cow",
    printcolumn = r#"{"name":"Greeting","type":"string","jsonPath":".spec.greeting"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".status.appliedPort"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LolcowSpec {
    /// Greeting passed to the workload as its final command argument
    #[serde(default)]
    pub greeting: String,

    /// Externally reachable (node) port. 0 means unset and falls back to 30685.
    #[serde(default)]
    pub port: i32,
}

impl LolcowSpec {
    /// Port the Service should expose externally, after defaulting.
    #[must_use]
    pub fn effective_port(&self) -> i32 {
        if self.port == 0 {
            DEFAULT_NODE_PORT
        } else {
            self.port
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LolcowStatus {
    /// Greeting most recently applied to the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_greeting: Option<String>,

    /// External port most recently applied to the Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_port: Option<i32>,

    /// Reconciliation state
    #[serde(default)]
    pub state: LolcowState,

    /// Reason the declaration was rejected, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the applied greeting or port last changed.
    /// Not bumped on every reconcile, otherwise each status write would
    /// trigger another reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<chrono::DateTime<chrono::Utc>>,
}

/// Lolcow reconciliation state
///
/// Serializes as PascalCase ("Converged", "Invalid", ...) but also accepts
/// lowercase on the way in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum LolcowState {
    /// Not reconciled yet
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Workload and Service match the declaration
    #[serde(alias = "converged")]
    Converged,

    /// Declaration rejected; needs a human to fix the spec
    #[serde(alias = "invalid")]
    Invalid,
}

impl LolcowState {
    /// String form used in the CRD schema
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LolcowState::Pending => "Pending",
            LolcowState::Converged => "Converged",
            LolcowState::Invalid => "Invalid",
        }
    }
}
