//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store,
//! reconciler, watcher and probe server together and runs them until a
//! shutdown signal arrives.

use crate::backoff::BackoffRegistry;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::reconciler::synthesizer::SynthesisSettings;
use crate::telemetry::{self, Metrics, ProbeState};
use crate::watcher::{self, Context};
use kube::Client;
use resource_store::KubeStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main controller for Lolcow resources.
#[derive(Debug)]
pub struct Controller {
    watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Lolcow Controller");

        let client = Client::try_default().await?;
        let metrics = Arc::new(Metrics::new()?);
        let cancel = CancellationToken::new();

        let reconciler = Reconciler::new(
            Arc::new(KubeStore::new(client.clone())),
            SynthesisSettings {
                image: config.image.clone(),
                endpoint_type: config.endpoint_type,
            },
            config.requeue_after,
            Arc::clone(&metrics),
        );
        let ctx = Arc::new(Context {
            reconciler: Arc::new(reconciler),
            backoff: BackoffRegistry::new(config.backoff_min, config.backoff_max),
            cancel: cancel.clone(),
        });

        let probe_state = ProbeState::new(metrics);
        let probe_server = tokio::spawn(telemetry::serve(config.probe_addr, probe_state.clone(), cancel.clone()));

        let watcher = {
            let config = config.clone();
            tokio::spawn(async move { watcher::watch_lolcows(client, &config, ctx).await })
        };
        probe_state.set_ready(true);
        info!("✅ Lolcow watcher started");

        Ok(Self {
            watcher,
            probe_server,
            cancel,
        })
    }

    /// Runs until SIGINT/SIGTERM or until a background task fails.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Self {
            mut watcher,
            mut probe_server,
            cancel,
        } = self;

        let result = tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
            res = &mut watcher => flatten("Lolcow watcher", res),
            res = &mut probe_server => flatten("Probe server", res),
        };

        cancel.cancel();
        if !watcher.is_finished() {
            if let Err(e) = flatten("Lolcow watcher", watcher.await) {
                warn!("Lolcow watcher stopped with error: {}", e);
            }
        }
        if !probe_server.is_finished() {
            if let Err(e) = flatten("Probe server", probe_server.await) {
                warn!("Probe server stopped with error: {}", e);
            }
        }

        info!("Lolcow Controller stopped");
        result
    }
}

fn flatten(
    task: &str,
    res: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} failed: {}", task, e);
            Err(e)
        }
        Err(e) => {
            error!("{} task panicked: {}", task, e);
            Err(ControllerError::Watch(format!("{} task failed: {}", task, e)))
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM ({}), only handling Ctrl-C", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
