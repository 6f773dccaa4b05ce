//! Lolcow Controller
//!
//! Level-triggered controller for `Lolcow` resources. Each Lolcow is realised
//! as a single-replica Deployment running the greeting server plus a Service
//! exposing it on a node port. External changes to either object are reverted,
//! and both are removed once the Lolcow is gone.

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod subscription;
mod telemetry;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls transport needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(ControllerError::InvalidConfig(
            "failed to install the rustls crypto provider".to_string(),
        ));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Lolcow Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Image: {}", config.image);
    info!("  Endpoint type: {}", config.endpoint_type);
    info!("  Requeue after: {:?}", config.requeue_after);
    info!("  Backoff: {:?}..{:?}", config.backoff_min, config.backoff_max);
    info!("  Concurrency: {}", config.concurrency);
    info!("  Probe address: {}", config.probe_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
