//! Reconciliation logic for Lolcow resources.
//!
//! - `synthesizer`: target Deployment/Service for a Lolcow
//! - `diff`: owned-field comparison of target and actual objects
//! - `status`: `Lolcow.status` reporting
//!
//! Every invocation re-derives what to do from the objects it fetches, so the
//! reconciler keeps no per-Lolcow state between calls.

pub mod diff;
pub mod status;
pub mod synthesizer;

#[cfg(test)]
mod reconciler_test;

use crate::error::ControllerError;
use crate::telemetry::{Metrics, Outcome};
use crds::Lolcow;
use kube::Resource;
use resource_store::{ManagedObject, ObjectKey, PatchSet, ResourceKind, ResourceStoreTrait};
use std::sync::Arc;
use std::time::Duration;
use synthesizer::{SynthesisSettings, Targets};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Uniform operations over the managed kinds.
///
/// Both targets are synthesized together in one pass (they share labels and
/// owner metadata); `synthesize` picks this kind's object out of that pass.
/// Writes are issued by [`Reconciler::ensure`], which also owns the
/// ownership checks and cancellation checkpoints around them.
pub trait ManagedKind {
    /// Target object of this kind
    fn synthesize(self, targets: &Targets) -> ManagedObject;
    /// Owned-field changes needed to move `actual` to `target`
    fn diff(self, target: &ManagedObject, actual: &ManagedObject) -> PatchSet;
}

impl ManagedKind for ResourceKind {
    fn synthesize(self, targets: &Targets) -> ManagedObject {
        targets.get(self)
    }

    fn diff(self, target: &ManagedObject, actual: &ManagedObject) -> PatchSet {
        match (self, target, actual) {
            (ResourceKind::Workload, ManagedObject::Workload(t), ManagedObject::Workload(a)) => {
                diff::diff_workload(t, a)
            }
            (ResourceKind::Endpoint, ManagedObject::Endpoint(t), ManagedObject::Endpoint(a)) => {
                diff::diff_endpoint(t, a)
            }
            _ => diff::diff(target, actual),
        }
    }
}

/// What `ensure` did for one managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Patched,
    /// Leftover of a deleted Lolcow with the same name was removed
    Replaced,
    Unchanged,
}

/// Reconciles Lolcow resources.
pub struct Reconciler {
    store: Arc<dyn ResourceStoreTrait>,
    settings: SynthesisSettings,
    requeue_after: Duration,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .field("requeue_after", &self.requeue_after)
            .finish_non_exhaustive()
    }
}

/// Fails with `Cancelled` once shutdown was requested
fn checkpoint(cancel: &CancellationToken) -> Result<(), ControllerError> {
    if cancel.is_cancelled() {
        Err(ControllerError::Cancelled)
    } else {
        Ok(())
    }
}

fn lolcow_kind() -> String {
    Lolcow::kind(&()).into_owned()
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStoreTrait>,
        settings: SynthesisSettings,
        requeue_after: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            settings,
            requeue_after,
            metrics,
        }
    }

    pub fn requeue_after(&self) -> Duration {
        self.requeue_after
    }

    /// Drives the objects managed for `key` towards its Lolcow.
    ///
    /// Returns `Some(delay)` when something was written and the result should
    /// be re-validated, `None` when everything already matched.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Option<Duration>, ControllerError> {
        match self.reconcile_key(key, cancel).await {
            Ok((outcome, requeue)) => {
                self.metrics.record_outcome(outcome);
                Ok(requeue)
            }
            Err(e) => {
                self.metrics.record_outcome(Outcome::Failed);
                self.metrics.record_error(e.class());
                Err(e)
            }
        }
    }

    async fn reconcile_key(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<(Outcome, Option<Duration>), ControllerError> {
        checkpoint(cancel)?;
        let lolcow = match self.store.get_lolcow(key).await {
            Ok(lolcow) => lolcow,
            Err(e) if e.is_not_found() => {
                let removed = self.cleanup_orphans(key, None, cancel).await?;
                let outcome = if removed > 0 { Outcome::CleanedUp } else { Outcome::Converged };
                return Ok((outcome, None));
            }
            Err(e) => return Err(e.into()),
        };

        if lolcow.metadata.deletion_timestamp.is_some() {
            debug!("Lolcow {} is being deleted, leaving dependents to garbage collection", key);
            return Ok((Outcome::Converged, None));
        }

        info!("Reconciling Lolcow {}", key);
        match self.converge(key, &lolcow, cancel).await {
            Err(ControllerError::Invalid(reason)) => {
                Err(ControllerError::Invalid(self.record_invalid(key, &lolcow, reason, cancel).await))
            }
            Err(ControllerError::Unmanaged(reason)) => {
                Err(ControllerError::Unmanaged(self.record_invalid(key, &lolcow, reason, cancel).await))
            }
            other => other,
        }
    }

    async fn record_invalid(&self, key: &ObjectKey, lolcow: &Lolcow, reason: String, cancel: &CancellationToken) -> String {
        warn!("⚠️ Lolcow {} is invalid: {}", key, reason);
        if !cancel.is_cancelled() {
            if let Err(e) = status::report_invalid(self.store.as_ref(), lolcow, &reason).await {
                warn!("Failed to record invalid status for Lolcow {}: {}", key, e);
            }
        }
        reason
    }

    async fn converge(
        &self,
        key: &ObjectKey,
        lolcow: &Lolcow,
        cancel: &CancellationToken,
    ) -> Result<(Outcome, Option<Duration>), ControllerError> {
        synthesizer::validate(&lolcow.spec)?;
        let targets = synthesizer::synthesize(lolcow, &self.settings)?;

        let mut changed = false;
        for kind in ResourceKind::ALL {
            let applied = self.ensure(lolcow, kind, &targets, cancel).await?;
            changed |= applied != Applied::Unchanged;
        }

        checkpoint(cancel)?;
        let greeting = lolcow.spec.greeting.as_str();
        let port = lolcow.spec.effective_port();
        let mut requeue = changed;
        if let Err(e) = status::report_applied(self.store.as_ref(), lolcow, greeting, port).await {
            warn!("Failed to update status for Lolcow {}: {}", key, e);
            requeue = true;
        }

        if requeue {
            let outcome = if changed { Outcome::Changed } else { Outcome::Converged };
            Ok((outcome, Some(self.requeue_after)))
        } else {
            debug!("Lolcow {} is up to date", key);
            Ok((Outcome::Converged, None))
        }
    }

    /// Brings the managed object of `kind` in line with its target: at most
    /// one write per call.
    pub async fn ensure(
        &self,
        lolcow: &Lolcow,
        kind: ResourceKind,
        targets: &Targets,
        cancel: &CancellationToken,
    ) -> Result<Applied, ControllerError> {
        let target = kind.synthesize(targets);
        let key = target
            .key()
            .ok_or_else(|| ControllerError::MissingMetadata(format!("target {} has no name", kind)))?;
        let owner_name = lolcow.metadata.name.as_deref().unwrap_or_default();
        let owner_kind = lolcow_kind();

        checkpoint(cancel)?;
        let actual = match self.store.get(kind, &key).await {
            Ok(actual) => actual,
            Err(e) if e.is_not_found() => {
                checkpoint(cancel)?;
                info!("✨ Creating {} {}", kind, key);
                self.store.create(&target).await?;
                self.metrics.record_write(kind, "create");
                return Ok(Applied::Created);
            }
            Err(e) => return Err(e.into()),
        };

        if !actual.is_controlled_by(&owner_kind, owner_name, lolcow.metadata.uid.as_deref()) {
            if actual.is_controlled_by(&owner_kind, owner_name, None) {
                // controlled by an earlier Lolcow of the same name that no longer exists
                checkpoint(cancel)?;
                info!("Removing {} {} left behind by a previous Lolcow {}", kind, key, owner_name);
                match self.store.delete(kind, &key).await {
                    Ok(()) => self.metrics.record_write(kind, "delete"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(Applied::Replaced);
            }
            return Err(ControllerError::Unmanaged(format!(
                "{} {} exists and is not managed by Lolcow {}",
                kind, key, owner_name
            )));
        }

        let patch = kind.diff(&target, &actual);
        if patch.is_empty() {
            debug!("{} {} is up to date", kind, key);
            return Ok(Applied::Unchanged);
        }

        checkpoint(cancel)?;
        info!("Updating {} {}: {}", kind, key, patch.describe());
        self.store.patch(&key, &patch, actual.resource_version()).await?;
        self.metrics.record_write(kind, "patch");
        Ok(Applied::Patched)
    }

    /// Cleans up after a Lolcow that has left the watch cache.
    ///
    /// The key is re-read first: a Lolcow recreated under the same name is left
    /// to its own reconcile, and only objects controlled by `owner_uid` (when
    /// known) are removed.
    pub async fn cleanup_vanished(
        &self,
        key: &ObjectKey,
        owner_uid: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize, ControllerError> {
        let result = async {
            checkpoint(cancel)?;
            match self.store.get_lolcow(key).await {
                Ok(_) => {
                    debug!("Lolcow {} exists again, skipping cleanup", key);
                    return Ok(0);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            self.cleanup_orphans(key, owner_uid, cancel).await
        }
        .await;

        match &result {
            Ok(removed) => {
                let outcome = if *removed > 0 { Outcome::CleanedUp } else { Outcome::Converged };
                self.metrics.record_outcome(outcome);
            }
            Err(e) => {
                self.metrics.record_outcome(Outcome::Failed);
                self.metrics.record_error(e.class());
            }
        }
        result
    }

    /// Deletes managed objects whose Lolcow is gone. Only objects whose
    /// controlling owner is a Lolcow named like `key` (and with `owner_uid`,
    /// if given) are touched. Returns the number of objects removed.
    pub async fn cleanup_orphans(
        &self,
        key: &ObjectKey,
        owner_uid: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize, ControllerError> {
        let owner_kind = lolcow_kind();
        let mut removed = 0;

        for kind in ResourceKind::ALL {
            let object_key = synthesizer::derived_key(kind, key);
            checkpoint(cancel)?;
            let actual = match self.store.get(kind, &object_key).await {
                Ok(actual) => actual,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if !actual.is_controlled_by(&owner_kind, &key.name, owner_uid) {
                debug!("Leaving {} {}: not controlled by Lolcow {}", kind, object_key, key.name);
                continue;
            }

            checkpoint(cancel)?;
            match self.store.delete(kind, &object_key).await {
                Ok(()) => {
                    info!("Deleted orphaned {} {}", kind, object_key);
                    self.metrics.record_write(kind, "delete");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }
}
