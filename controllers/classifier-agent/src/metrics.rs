//! Prometheus metrics and the probes endpoint.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Agent metrics, registered in their own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Watch subscriptions currently open
    pub active_watches: IntGauge,
    /// Desired kinds waiting to be installed
    pub pending_kinds: IntGauge,
    /// Failed attempts to open a watch
    pub watch_start_failures: IntCounter,
    /// Failed discovery passes
    pub discovery_failures: IntCounter,
    /// Classifier evaluations
    pub evaluations: IntCounter,
    /// Classifier match transitions (non-match to match)
    pub matches: IntCounter,
    /// Node reconciliations
    pub node_reconciliations: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new_custom(Some("classifier_agent".to_string()), None)?;

        let active_watches = IntGauge::new("active_watches", "Watch subscriptions currently open")?;
        let pending_kinds = IntGauge::new("pending_kinds", "Desired resource kinds not yet installed")?;
        let watch_start_failures = IntCounter::new("watch_start_failures_total", "Failed attempts to open a watch")?;
        let discovery_failures = IntCounter::new("discovery_failures_total", "Failed discovery passes")?;
        let evaluations = IntCounter::new("evaluations_total", "Classifier evaluations")?;
        let matches = IntCounter::new("matches_total", "Classifier transitions to match")?;
        let node_reconciliations = IntCounter::new("node_reconciliations_total", "Node reconciliations")?;

        registry.register(Box::new(active_watches.clone()))?;
        registry.register(Box::new(pending_kinds.clone()))?;
        registry.register(Box::new(watch_start_failures.clone()))?;
        registry.register(Box::new(discovery_failures.clone()))?;
        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(matches.clone()))?;
        registry.register(Box::new(node_reconciliations.clone()))?;

        Ok(Self {
            registry,
            active_watches,
            pending_kinds,
            watch_start_failures,
            discovery_failures,
            evaluations,
            matches,
            node_reconciliations,
        })
    }

    /// Renders the registry in the text exposition format.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        exposition_text(buffer)
    }
}

fn exposition_text(buffer: Vec<u8>) -> Result<String, ControllerError> {
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("metrics output is not UTF-8: {e}")).into())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Router serving `/metrics` and `/healthz`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics)
}

/// Serves the metrics router until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics on {}", addr);
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
