//! gRPC transport to the node-local cluster agent

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use super::ClusterAgent;
use crate::error::AgentError;
use crate::models::RawConfig;
use crate::patch::PatchOp;
use crate::proto::{
    AgentClient, GetConfigRequest, GetNodeRequest, HealthCheckRequest, JsonPatch,
    PatchNodeRequest, UpdateNodeCapacityRequest,
};

/// Cluster agent reached over a unix domain socket.
#[derive(Debug, Clone)]
pub struct GrpcClusterAgent {
    socket: PathBuf,
    client: AgentClient<Channel>,
}

impl GrpcClusterAgent {
    /// Set up a lazily connecting channel to the agent socket.
    pub async fn connect(socket: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let socket = socket.into();
        let path = socket.clone();

        // the authority is ignored by the connector
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| AgentError::Connect {
                socket: socket.display().to_string(),
                message: e.to_string(),
            })?
            .connect_with_connector_lazy(service_fn(move |_: Uri| {
                UnixStream::connect(path.clone())
            }));

        debug!(socket = %socket.display(), "Created agent client");

        Ok(Self {
            socket,
            client: AgentClient::new(channel),
        })
    }

    pub fn socket(&self) -> &std::path::Path {
        &self.socket
    }
}

fn to_wire(patch: &PatchOp) -> JsonPatch {
    JsonPatch {
        op: patch.op.as_str().to_string(),
        path: patch.path.clone(),
        value: patch.value.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl ClusterAgent for GrpcClusterAgent {
    async fn get_node(&self) -> Result<Node, AgentError> {
        let reply = self
            .client
            .clone()
            .get_node(GetNodeRequest {})
            .await
            .map_err(|s| AgentError::transport("get node", s.message()))?
            .into_inner();

        serde_json::from_str(&reply.node).map_err(|e| {
            AgentError::InvalidResponse(format!("failed to decode node object: {}", e))
        })
    }

    async fn patch_node(&self, patches: &[PatchOp]) -> Result<(), AgentError> {
        let request = PatchNodeRequest {
            patches: patches.iter().map(to_wire).collect(),
        };
        self.client
            .clone()
            .patch_node(request)
            .await
            .map_err(|s| AgentError::transport("patch node", s.message()))?;
        Ok(())
    }

    async fn update_node_capacity(
        &self,
        capacities: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let request = UpdateNodeCapacityRequest {
            capacities: capacities
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        self.client
            .clone()
            .update_node_capacity(request)
            .await
            .map_err(|s| AgentError::transport("update node capacities", s.message()))?;
        Ok(())
    }

    async fn get_config(&self) -> Result<RawConfig, AgentError> {
        let reply = self
            .client
            .clone()
            .get_config(GetConfigRequest {})
            .await
            .map_err(|s| AgentError::transport("get config", s.message()))?
            .into_inner();

        Ok(RawConfig::new(reply.node_name, reply.config.into_iter().collect()))
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        let reply = self
            .client
            .clone()
            .health_check(HealthCheckRequest {
                query: String::new(),
            })
            .await
            .map_err(|s| AgentError::transport("check agent health", s.message()))?
            .into_inner();

        if reply.error.is_empty() {
            Ok(())
        } else {
            Err(AgentError::InvalidResponse(reply.error))
        }
    }
}
