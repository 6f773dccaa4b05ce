//! Controller-specific error types.
//!
//! This module defines error types specific to the Lolcow Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use resource_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the Lolcow Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resource store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Kubernetes client error outside the store (client bootstrap)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Declaration that cannot be realised until a human changes it
    #[error("Invalid Lolcow: {0}")]
    Invalid(String),

    /// A same-name object not controlled by this Lolcow is in the way.
    /// Its removal produces no event for the Lolcow, so this is retried.
    #[error("{0}")]
    Unmanaged(String),

    /// Object lacks metadata the controller relies on (name, uid)
    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invocation abandoned because shutdown was requested
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe/metrics server failed
    #[error("Probe server error: {0}")]
    Probe(#[from] std::io::Error),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Retry class of an error, drives the error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    Transient,
    Invalid,
    Cancelled,
}

impl ErrorClass {
    /// Label value used in metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Invalid => "invalid",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl ControllerError {
    /// Classifies the error for retry decisions.
    ///
    /// Forbidden and rejected requests are `Transient`: they usually mean RBAC
    /// or an API-side problem that gets fixed without touching the Lolcow, so
    /// they are retried with backoff rather than parked. `Unmanaged` is
    /// `Transient` for the same reason.
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Store(StoreError::NotFound(_)) => ErrorClass::NotFound,
            ControllerError::Store(StoreError::Conflict(_)) => ErrorClass::Conflict,
            ControllerError::Store(_) => ErrorClass::Transient,
            ControllerError::Kube(_) | ControllerError::Unmanaged(_) => ErrorClass::Transient,
            ControllerError::Invalid(_) | ControllerError::MissingMetadata(_) => ErrorClass::Invalid,
            ControllerError::InvalidConfig(_) => ErrorClass::Invalid,
            ControllerError::Cancelled => ErrorClass::Cancelled,
            ControllerError::Watch(_) | ControllerError::Probe(_) | ControllerError::Metrics(_) => {
                ErrorClass::Transient
            }
        }
    }
}
