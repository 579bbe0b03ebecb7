//! Health, status and metrics endpoints of the resource manager daemon

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use resmgr_lib::{health::HealthRegistry, ReadinessResponse, ResourceManager};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub resmgr: ResourceManager,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, resmgr: ResourceManager) -> Self {
        Self {
            health_registry,
            resmgr,
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Ready once the relay serves the runtime socket and no component is down.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut readiness = state.health_registry.readiness().await;
    if readiness.ready && !state.resmgr.is_running().await {
        readiness = ReadinessResponse {
            ready: false,
            reason: Some("resource manager is not running".to_string()),
        };
    }

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.resmgr.status().await)
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/status", get(status))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
