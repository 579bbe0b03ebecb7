//! Daemon endpoints against a real resource manager

#[path = "../src/api.rs"]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use resmgr_lib::{
    health::{components, HealthRegistry},
    observability::ResmgrMetrics,
    AgentInterface, ResmgrOptions, ResourceManager,
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestDaemon {
    _dir: TempDir,
    app: Router,
    state: Arc<AppState>,
}

async fn daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let mut options = ResmgrOptions::for_node(
        "node-1",
        dir.path().join("resmgr.sock"),
        dir.path().join("runtime.sock"),
    );
    options.cache_dir = dir.path().join("cache");

    let health = HealthRegistry::new();
    let resmgr = ResourceManager::new(options, AgentInterface::disabled(), health.clone())
        .await
        .unwrap();
    let state = Arc::new(AppState::new(health, resmgr));

    TestDaemon {
        _dir: dir,
        app: create_router(state.clone()),
        state,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_disabled_agent_degrades_but_stays_healthy() {
    let daemon = daemon().await;

    let (status, health) = get_json(&daemon.app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["agent"]["status"], "degraded");
    assert!(health["components"]["policy"].is_object());
    assert!(health["components"]["cache"].is_object());
}

#[tokio::test]
async fn test_unhealthy_relay_fails_liveness_and_readiness() {
    let daemon = daemon().await;
    daemon.state.resmgr.start().await.unwrap();
    daemon
        .state
        .health_registry
        .set_unhealthy(components::RELAY, "runtime socket gone")
        .await;

    let (status, health) = get_json(&daemon.app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["components"]["relay"]["message"], "runtime socket gone");

    let (status, _) = get_json(&daemon.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    daemon.state.resmgr.stop().await;
}

#[tokio::test]
async fn test_readiness_follows_resource_manager() {
    let daemon = daemon().await;

    let (status, readiness) = get_json(&daemon.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    daemon.state.resmgr.start().await.unwrap();
    let (status, readiness) = get_json(&daemon.app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    daemon.state.resmgr.stop().await;
    let (status, _) = get_json(&daemon.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readiness_requires_running_manager() {
    let daemon = daemon().await;
    // a registry marked ready is not enough on its own
    daemon.state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(&daemon.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "resource manager is not running");
}

#[tokio::test]
async fn test_status_reports_policy_and_relay() {
    let daemon = daemon().await;

    let (status, report) = get_json(&daemon.app, "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["nodeName"], "node-1");
    assert_eq!(report["policy"], "none");
    assert_eq!(report["configSource"], "builtin");
    assert_eq!(report["running"], false);

    daemon.state.resmgr.start().await.unwrap();
    let (_, report) = get_json(&daemon.app, "/v1/status").await;
    assert_eq!(report["running"], true);
    assert_eq!(report["eventsConnected"], false);
    assert_eq!(report["eventSubscribers"], 0);
    // listening is disabled by default
    assert!(report.get("configServer").is_none());

    daemon.state.resmgr.stop().await;
}

#[tokio::test]
async fn test_metrics_expose_relay_series() {
    let daemon = daemon().await;
    let metrics = ResmgrMetrics::new();
    for latency in [0.001, 0.005, 0.01] {
        metrics.observe_relayed_call("/runtime.v1.RuntimeService/ListContainers", true, latency);
    }
    metrics.inc_evicted_subscribers();

    let (status, body) = get(&daemon.app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("resmgr_relayed_calls_total"));
    assert!(text.contains("resmgr_relay_latency_seconds_bucket"));
    assert!(text.contains("resmgr_event_subscribers_evicted_total"));
}
