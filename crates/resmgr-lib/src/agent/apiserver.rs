//! Direct API server access in place of a node-local agent

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::watcher::{ConfigWatcher, ConfigWatcherOptions};
use super::{validate_capacities, ClusterAgent};
use crate::error::AgentError;
use crate::models::RawConfig;
use crate::patch::{encode_patches, PatchOp};
use crate::watch::{KubeObjectSource, ObjectSource};

/// Cluster agent implemented in-process on top of the API server.
pub struct KubeClusterAgent {
    client: Client,
    nodes: Api<Node>,
    node_name: String,
    config: ConfigWatcher,
}

impl std::fmt::Debug for KubeClusterAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterAgent")
            .field("node_name", &self.node_name)
            .finish()
    }
}

impl KubeClusterAgent {
    /// Connect using the in-cluster (or kubeconfig) client configuration.
    pub async fn in_cluster(node_name: &str) -> Result<Self, AgentError> {
        let client = Client::try_default()
            .await
            .map_err(|e| AgentError::Connect {
                socket: "in-cluster".to_string(),
                message: e.to_string(),
            })?;
        Self::new(client, ConfigWatcherOptions::for_node(node_name))
    }

    pub fn new(client: Client, options: ConfigWatcherOptions) -> Result<Self, AgentError> {
        if options.node_name.is_empty() {
            return Err(AgentError::MissingNodeName);
        }

        let node_source: Arc<dyn ObjectSource<Node>> =
            Arc::new(KubeObjectSource::<Node>::cluster(client.clone()));
        let map_source: Arc<dyn ObjectSource<ConfigMap>> = Arc::new(
            KubeObjectSource::<ConfigMap>::namespaced(client.clone(), &options.namespace),
        );

        info!(node = %options.node_name, namespace = %options.namespace, "Watching node configuration");

        let node_name = options.node_name.clone();
        let config = ConfigWatcher::start(options, node_source, map_source)?;

        Ok(Self {
            nodes: Api::all(client.clone()),
            client,
            node_name,
            config,
        })
    }
}

#[async_trait]
impl ClusterAgent for KubeClusterAgent {
    async fn get_node(&self) -> Result<Node, AgentError> {
        self.nodes.get(&self.node_name).await.map_err(|e| {
            AgentError::transport(
                "get node",
                format!("node {:?}: {}", self.node_name, e),
            )
        })
    }

    async fn patch_node(&self, patches: &[PatchOp]) -> Result<(), AgentError> {
        let body = encode_patches(patches).map_err(|e| AgentError::Encode {
            what: "node patches".to_string(),
            source: e,
        })?;
        let patch: json_patch::Patch =
            serde_json::from_str(&body).map_err(|e| AgentError::Encode {
                what: "node patches".to_string(),
                source: e,
            })?;

        self.nodes
            .patch(&self.node_name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .map_err(|e| AgentError::transport("patch node", e))?;
        Ok(())
    }

    async fn update_node_capacity(
        &self,
        capacities: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        validate_capacities(capacities)?;
        let status = serde_json::json!({ "status": { "capacity": capacities } });

        self.nodes
            .patch_status(&self.node_name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map_err(|e| AgentError::transport("update node capacities", e))?;
        Ok(())
    }

    async fn get_config(&self) -> Result<RawConfig, AgentError> {
        Ok(self.config.current())
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| AgentError::transport("check agent health", e))
    }
}
