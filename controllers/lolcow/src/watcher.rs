//! Kubernetes resource watchers.
//!
//! Wires the reconciler to `kube_runtime::Controller`. Lolcow events drive
//! reconciles directly; events on owned Deployments and Services pass through
//! their subscription filter and are mapped back to the owning Lolcow.
//!
//! Lolcow deletes are triggers too. The runtime never reconciles a Lolcow it
//! can no longer find, so those keys (reported as `ObjectNotFound`) get a
//! cleanup pass of their own, spawned off the result stream.

use crate::backoff::BackoffRegistry;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ErrorClass};
use crate::reconciler::Reconciler;
use crate::subscription::{SubscriptionFilter, subscribe, subscribe_primary};
use crds::Lolcow;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use kube_runtime::controller::{self, Action, Config as RuntimeConfig};
use kube_runtime::reflector;
use kube_runtime::Controller;
use resource_store::{ObjectKey, ResourceKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every reconcile
#[derive(Debug)]
pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub backoff: BackoffRegistry,
    pub cancel: CancellationToken,
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn lolcow_key(obj: &Lolcow) -> Result<ObjectKey, ControllerError> {
    ObjectKey::from_resource(obj).ok_or_else(|| ControllerError::MissingMetadata("Lolcow has no name".to_string()))
}

async fn reconcile(obj: Arc<Lolcow>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let key = lolcow_key(&obj)?;
    let requeue = ctx.reconciler.reconcile(&key, &ctx.cancel).await?;
    ctx.backoff.reset(&key);
    Ok(match requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Decides when a failed reconcile runs again
pub fn error_policy(obj: Arc<Lolcow>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = lolcow_key(&obj).ok();
    let name = key.as_ref().map(ToString::to_string).unwrap_or_default();
    match error.class() {
        ErrorClass::Conflict => {
            debug!("Conflict reconciling Lolcow {}, retrying: {}", name, error);
            Action::requeue(ctx.reconciler.requeue_after())
        }
        ErrorClass::Invalid => {
            debug!("Lolcow {} waits for a spec change: {}", name, error);
            Action::await_change()
        }
        ErrorClass::Cancelled => Action::await_change(),
        ErrorClass::NotFound | ErrorClass::Transient => {
            let (delay, attempt) = match &key {
                Some(key) => (ctx.backoff.next(key), ctx.backoff.error_count(key)),
                None => (ctx.reconciler.requeue_after(), 1),
            };
            error!(
                "Reconciliation error for Lolcow {} (attempt {}): {} (retrying in {:?})",
                name, attempt, error, delay
            );
            Action::requeue(delay)
        }
    }
}

/// Removes what a vanished Lolcow left behind
async fn cleanup_vanished(ctx: Arc<Context>, key: ObjectKey, owner_uid: Option<String>) {
    match ctx.reconciler.cleanup_vanished(&key, owner_uid.as_deref(), &ctx.cancel).await {
        Ok(removed) => {
            ctx.backoff.reset(&key);
            debug!("Cleanup pass for vanished Lolcow {} removed {} object(s)", key, removed);
        }
        Err(ControllerError::Cancelled) => {}
        Err(e) => warn!("Cleanup for vanished Lolcow {} failed: {}", key, e),
    }
}

/// Watches Lolcows and their owned objects until `ctx.cancel` fires.
pub async fn watch_lolcows(client: Client, config: &ControllerConfig, ctx: Arc<Context>) -> Result<(), ControllerError> {
    let namespace = config.namespace.as_deref();
    info!(
        "Starting Lolcow watcher ({})",
        namespace.map_or_else(|| "all namespaces".to_string(), |ns| format!("namespace {}", ns))
    );

    let lolcows: Api<Lolcow> = scoped_api(client.clone(), namespace);
    let (reader, writer) = reflector::store();
    let runtime_config = RuntimeConfig::default().concurrency(config.concurrency);
    let mut controller =
        Controller::for_stream(subscribe_primary(lolcows, writer), reader).with_config(runtime_config);

    for filter in &config.subscriptions {
        controller = own(controller, client.clone(), namespace, filter);
    }

    let cancel = ctx.cancel.clone();
    let results = controller
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|res| {
            let ctx = Arc::clone(&ctx);
            async move {
                match res {
                    Ok((obj_ref, action)) => debug!("Reconciled Lolcow {}: {:?}", obj_ref, action),
                    Err(controller::Error::ObjectNotFound(obj_ref)) => {
                        let namespace = obj_ref.namespace.as_deref().unwrap_or("default");
                        let key = ObjectKey::new(namespace, obj_ref.name.as_str());
                        tokio::spawn(cleanup_vanished(ctx, key, obj_ref.extra.uid.clone()));
                    }
                    // already handled by the error policy
                    Err(controller::Error::ReconcilerFailed(e, obj_ref)) => {
                        debug!("Reconcile of {} failed: {}", obj_ref, e);
                    }
                    Err(e) => error!("Controller error for Lolcow: {}", e),
                }
            }
        });

    tokio::select! {
        () = results => {
            warn!("Lolcow watcher stream ended");
            if !cancel.is_cancelled() {
                return Err(ControllerError::Watch("Lolcow controller stream ended".to_string()));
            }
        }
        () = cancel.cancelled() => info!("Lolcow watcher stopping"),
    }

    Ok(())
}

/// Adds the owned-object stream of one subscription to the controller
fn own(
    controller: Controller<Lolcow>,
    client: Client,
    namespace: Option<&str>,
    filter: &SubscriptionFilter,
) -> Controller<Lolcow> {
    if !filter.is_active() {
        info!("Not subscribed to any {} events", filter.kind());
        return controller;
    }
    info!("Subscribing to {} events: {:?}", filter.kind(), filter);
    match filter.kind() {
        ResourceKind::Workload => {
            controller.owns_stream(subscribe(scoped_api::<Deployment>(client, namespace), filter.clone()))
        }
        ResourceKind::Endpoint => {
            controller.owns_stream(subscribe(scoped_api::<Service>(client, namespace), filter.clone()))
        }
    }
}
