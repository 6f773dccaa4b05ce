//! Resource store errors

use thiserror::Error;

/// Errors that can occur when talking to the resource store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist. Expected steady state for most lookups.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure (stale resourceVersion) or the object
    /// already exists on create
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store unreachable, overloaded or timed out
    #[error("Store unavailable: {0}")]
    Transient(String),

    /// Store rejected the request as malformed
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Authentication or RBAC failure
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Classifies a kube client error, prefixing the message with `context`
    /// (e.g. "get Deployment default/cow").
    pub fn from_kube(err: kube::Error, context: &str) -> Self {
        match err {
            kube::Error::Api(ae) => {
                let msg = format!("{}: {}", context, ae.message);
                match ae.code {
                    404 => StoreError::NotFound(msg),
                    409 => StoreError::Conflict(msg),
                    400 | 422 => StoreError::Invalid(msg),
                    401 | 403 => StoreError::Forbidden(msg),
                    _ => StoreError::Transient(msg),
                }
            }
            kube::Error::SerdeError(e) => StoreError::Serialization(e),
            other => StoreError::Transient(format!("{}: {}", context, other)),
        }
    }

    /// Returns true for [`StoreError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Returns true for [`StoreError::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Whether retrying the same request later can succeed without a human
    /// changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }
}
