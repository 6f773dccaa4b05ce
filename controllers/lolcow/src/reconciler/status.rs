//! Status reporting.
//!
//! `status.appliedGreeting` and `status.appliedPort` record what was last
//! realised. Writes only happen when the reported values differ from what is
//! stored, so a converged Lolcow is never rewritten.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::{Lolcow, LolcowState, LolcowStatus};
use resource_store::{ObjectKey, ResourceStoreTrait};
use tracing::{debug, info};

/// Status of a Lolcow whose workload and endpoint match `greeting`/`port`.
///
/// `lastApplied` is carried over unless the applied values change.
pub fn applied_status(current: Option<&LolcowStatus>, greeting: &str, port: i32, now: DateTime<Utc>) -> LolcowStatus {
    let unchanged = current.is_some_and(|s| {
        s.applied_greeting.as_deref() == Some(greeting) && s.applied_port == Some(port)
    });
    LolcowStatus {
        applied_greeting: Some(greeting.to_string()),
        applied_port: Some(port),
        state: LolcowState::Converged,
        error: None,
        last_applied: if unchanged {
            current.and_then(|s| s.last_applied)
        } else {
            Some(now)
        },
    }
}

/// Status of a rejected Lolcow. The applied values still describe what is
/// running, so they are kept.
pub fn invalid_status(current: Option<&LolcowStatus>, reason: &str) -> LolcowStatus {
    let current = current.cloned().unwrap_or_default();
    LolcowStatus {
        state: LolcowState::Invalid,
        error: Some(reason.to_string()),
        ..current
    }
}

/// Whether writing `desired` would change the stored status.
///
/// `lastApplied` is ignored: it only moves together with the applied values.
pub fn status_needs_update(current: Option<&LolcowStatus>, desired: &LolcowStatus) -> bool {
    let Some(current) = current else {
        debug!("Status missing");
        return true;
    };
    if current.applied_greeting != desired.applied_greeting {
        debug!(
            "Applied greeting changed: {:?} -> {:?}",
            current.applied_greeting, desired.applied_greeting
        );
        return true;
    }
    if current.applied_port != desired.applied_port {
        debug!("Applied port changed: {:?} -> {:?}", current.applied_port, desired.applied_port);
        return true;
    }
    if current.state != desired.state {
        debug!("State changed: {} -> {}", current.state.as_str(), desired.state.as_str());
        return true;
    }
    if current.error != desired.error {
        debug!("Error changed: {:?} -> {:?}", current.error, desired.error);
        return true;
    }
    false
}

async fn write_status(
    store: &dyn ResourceStoreTrait,
    lolcow: &Lolcow,
    desired: &LolcowStatus,
) -> Result<bool, ControllerError> {
    if !status_needs_update(lolcow.status.as_ref(), desired) {
        return Ok(false);
    }
    let key = ObjectKey::from_resource(lolcow)
        .ok_or_else(|| ControllerError::MissingMetadata("Lolcow has no name".to_string()))?;
    store
        .patch_lolcow_status(&key, desired, lolcow.metadata.resource_version.as_deref())
        .await?;
    Ok(true)
}

/// Records that `greeting` and `port` are live. Returns whether a write was issued.
pub async fn report_applied(
    store: &dyn ResourceStoreTrait,
    lolcow: &Lolcow,
    greeting: &str,
    port: i32,
) -> Result<bool, ControllerError> {
    let desired = applied_status(lolcow.status.as_ref(), greeting, port, Utc::now());
    let written = write_status(store, lolcow, &desired).await?;
    if written {
        info!(
            "✅ Lolcow {} converged (greeting {:?}, port {})",
            lolcow.metadata.name.as_deref().unwrap_or_default(),
            greeting,
            port
        );
    }
    Ok(written)
}

/// Records why the declaration cannot be realised. Returns whether a write was issued.
pub async fn report_invalid(
    store: &dyn ResourceStoreTrait,
    lolcow: &Lolcow,
    reason: &str,
) -> Result<bool, ControllerError> {
    let desired = invalid_status(lolcow.status.as_ref(), reason);
    write_status(store, lolcow, &desired).await
}
