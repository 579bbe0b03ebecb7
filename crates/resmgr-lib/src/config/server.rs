//! HTTP endpoint receiving configuration and adjustment pushes

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ResmgrError};
use crate::models::{Adjustment, RawConfig};

/// Listen address turning the server off.
pub const DISABLED_LISTEN: &str = "disabled";

/// Receiver of pushed configuration and adjustments.
#[async_trait]
pub trait ConfigHandler: Send + Sync + 'static {
    async fn set_config(&self, config: RawConfig) -> Result<(), ResmgrError>;

    /// Apply adjustments, returning errors by adjustment name.
    async fn set_adjustment(&self, adjustment: Adjustment) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigRequest {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetConfigReply {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAdjustmentReply {
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

type SharedHandler = Arc<dyn ConfigHandler>;

async fn set_config(
    State(handler): State<SharedHandler>,
    Json(request): Json<SetConfigRequest>,
) -> Json<SetConfigReply> {
    debug!(node = %request.node_name, keys = request.config.len(), "SetConfig request");

    let config = RawConfig::new(request.node_name, request.config);
    let reply = match handler.set_config(config).await {
        Ok(()) => SetConfigReply::default(),
        Err(e) => SetConfigReply {
            error: format!("failed to apply configuration: {}", e),
        },
    };

    Json(reply)
}

async fn set_adjustment(State(handler): State<SharedHandler>, body: Bytes) -> Response {
    let adjustment: Adjustment = match serde_json::from_slice(&body) {
        Ok(adjustment) => adjustment,
        Err(e) => {
            warn!(error = %e, "Failed to decode SetAdjustment request");
            let error = ConfigError::Decode(e).to_string();
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": error })),
            )
                .into_response();
        }
    };

    debug!(specs = adjustment.specs.len(), "SetAdjustment request");
    let errors = handler.set_adjustment(adjustment).await;

    Json(SetAdjustmentReply { errors }).into_response()
}

/// Routes of the configuration endpoint.
pub fn router(handler: SharedHandler) -> Router {
    Router::new()
        .route("/v1/config", post(set_config))
        .route("/v1/adjustment", post(set_adjustment))
        .with_state(handler)
}

/// Configuration push server.
pub struct ConfigServer {
    handler: SharedHandler,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConfigServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl ConfigServer {
    pub fn new(handler: SharedHandler) -> Self {
        Self {
            handler,
            local_addr: None,
            shutdown: None,
            task: None,
        }
    }

    /// Start serving on `listen`. An empty or `disabled` address leaves the
    /// server off.
    pub async fn start(&mut self, listen: &str) -> Result<(), ConfigError> {
        if listen.is_empty() || listen == DISABLED_LISTEN {
            info!("Configuration server is disabled");
            return Ok(());
        }
        if self.task.is_some() {
            return Err(ConfigError::Server("already running".to_string()));
        }

        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .map_err(|e| ConfigError::Server(format!("failed to listen on {}: {}", listen, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ConfigError::Server(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.handler.clone());

        info!(addr = %local_addr, "Starting configuration server");
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Configuration server failed");
            }
        });

        self.local_addr = Some(local_addr);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stop serving; a stopped server can be stopped again.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("Configuration server stopped");
        }
        self.local_addr = None;
    }
}
