//! HTTP API for Prometheus metrics, health checks and cache status

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use binpacking_lib::{
    health::{ComponentStatus, HealthRegistry},
    SyncInfo,
};
use anyhow::Context;
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub health_registry: HealthRegistry,
    pub sync_info: Arc<SyncInfo>,
    pub metrics_path: String,
    pub version: String,
}

impl AppState {
    pub fn new(
        registry: Registry,
        health_registry: HealthRegistry,
        sync_info: Arc<SyncInfo>,
        metrics_path: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            health_registry,
            sync_info,
            metrics_path: metrics_path.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Landing page linking every endpoint
async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Kube Cluster Binpacking Exporter</title></head>
<body>
<h1>Kube Cluster Binpacking Exporter</h1>
<p>Version: {version}</p>
<ul>
<li><a href="{path}">{path}</a> - Prometheus metrics</li>
<li><a href="/sync">/sync</a> - Cache sync status (JSON)</li>
<li><a href="/healthz">/healthz</a> - Liveness probe</li>
<li><a href="/readyz">/readyz</a> - Readiness probe</li>
</ul>
</body>
</html>
"#,
        version = state.version,
        path = state.metrics_path,
    ))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health_registry.observe_sync(&state.sync_info).await;
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once both caches have synced
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health_registry.observe_sync(&state.sync_info).await;
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Cache synchronization status
async fn sync_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sync_info.status())
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route("/", get(index))
        .route(&metrics_path, get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sync", get(sync_status))
        .with_state(state)
}

/// Serve the API on `addr` (`host:port`, host may be a name) until
/// `shutdown` resolves
pub async fn serve<F>(addr: String, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_path = state.metrics_path.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("Failed to bind API server to {addr}"))?;
    let local = listener.local_addr()?;
    info!(addr = %local, metrics_path = %metrics_path, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API server stopped");
    Ok(())
}
