//! Probes and Prometheus metrics.
//!
//! Serves `/healthz`, `/readyz` and `/metrics` on a small axum server that
//! shuts down together with the controller.

use crate::error::{ControllerError, ErrorClass};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TEXT_FORMAT, TextEncoder};
use resource_store::ResourceKind;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Outcome label of a finished reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing needed to change
    Converged,
    /// At least one managed object was written
    Changed,
    /// Managed objects removed after the Lolcow disappeared
    CleanedUp,
    /// Invocation ended with an error
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Converged => "converged",
            Outcome::Changed => "changed",
            Outcome::CleanedUp => "cleaned_up",
            Outcome::Failed => "failed",
        }
    }
}

/// Controller metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    writes: IntCounterVec,
    errors: IntCounterVec,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let reconciliations = IntCounterVec::new(
            Opts::new("lolcow_reconciliations_total", "Reconcile invocations by outcome"),
            &["outcome"],
        )?;
        let writes = IntCounterVec::new(
            Opts::new("lolcow_writes_total", "Writes to managed objects by kind and action"),
            &["kind", "action"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("lolcow_reconcile_errors_total", "Reconcile errors by retry class"),
            &["class"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(writes.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            writes,
            errors,
        })
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.reconciliations.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_write(&self, kind: ResourceKind, action: &str) {
        self.writes.with_label_values(&[kind.label(), action]).inc();
    }

    pub fn record_error(&self, class: ErrorClass) {
        self.errors.with_label_values(&[class.as_str()]).inc();
    }

    /// Renders all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Shared state of the probe endpoints
#[derive(Debug, Clone)]
pub struct ProbeState {
    ready: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl ProbeState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    /// Marks the controller as ready to serve
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Builds the probe router
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the probe endpoints until `cancel` fires
pub async fn serve(addr: SocketAddr, state: ProbeState, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Probe server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_readyz_follows_state() {
        let state = ProbeState::new(Arc::new(Metrics::new().unwrap()));

        let response = readyz(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_counters() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_outcome(Outcome::Changed);
        metrics.record_write(ResourceKind::Workload, "create");
        metrics.record_error(ErrorClass::Conflict);

        let response = super::metrics(State(ProbeState::new(metrics))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("lolcow_reconciliations_total{outcome=\"changed\"} 1"));
        assert!(text.contains("lolcow_writes_total{action=\"create\",kind=\"workload\"} 1"));
        assert!(text.contains("lolcow_reconcile_errors_total{class=\"conflict\"} 1"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let state = ProbeState::new(Arc::new(Metrics::new().unwrap()));
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let handle = tokio::spawn(serve(addr, state, cancel.clone()));
        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
