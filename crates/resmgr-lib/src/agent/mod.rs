//! Cluster-agent client
//!
//! This module provides the node-side view of the cluster agent:
//! - `ClusterAgent`, the transport seam (gRPC over a unix socket, or direct
//!   API server access)
//! - `AgentInterface`, which turns desired label/annotation/taint/capacity
//!   state into node patches with read-modify-write semantics
//!
//! Every remote call takes an optional timeout; `None` waits indefinitely.

mod grpc;
mod apiserver;
pub mod watcher;

pub use self::grpc::GrpcClusterAgent;
pub use self::apiserver::KubeClusterAgent;
pub use self::watcher::{ConfigWatcher, ConfigWatcherOptions};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::AgentError;
use crate::models::RawConfig;
use crate::patch::{self, MetadataClass, PatchOp};

/// Agent socket value that disables the agent interface.
pub const DISABLED_SOCKET: &str = "disabled";

/// Agent socket value selecting direct API server access.
pub const IN_CLUSTER_SOCKET: &str = "in-cluster";

/// Default timeout for agent calls made during startup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Remote operations offered by the cluster agent.
#[async_trait]
pub trait ClusterAgent: Send + Sync {
    /// Fetch the node this process runs on.
    async fn get_node(&self) -> Result<Node, AgentError>;

    /// Apply a patch sequence to the node, all or nothing.
    async fn patch_node(&self, patches: &[PatchOp]) -> Result<(), AgentError>;

    /// Update extended resource capacities in the node status.
    async fn update_node_capacity(
        &self,
        capacities: &BTreeMap<String, String>,
    ) -> Result<(), AgentError>;

    /// Fetch the effective configuration for this node.
    async fn get_config(&self) -> Result<RawConfig, AgentError>;

    /// Check that the agent is alive.
    async fn health_check(&self) -> Result<(), AgentError>;
}

/// Run an agent call with an optional deadline.
async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AgentError::Timeout { operation, timeout })?,
        None => fut.await,
    }
}

/// Check whether a resource is one the node reports natively.
pub fn is_native_resource(name: &str) -> bool {
    name == "cpu" || name == "memory" || name.starts_with("hugepages-")
}

/// Reject capacity updates the agent refuses.
pub fn validate_capacities(capacities: &BTreeMap<String, String>) -> Result<(), AgentError> {
    for name in capacities.keys() {
        if is_native_resource(name) {
            return Err(AgentError::InvalidCapacity(format!(
                "refusing to update capacity of native resource '{}'",
                name
            )));
        }
        if !name.contains('.') || !name.contains('/') {
            return Err(AgentError::InvalidCapacity(format!(
                "invalid resource '{}' in capacity update",
                name
            )));
        }
    }
    Ok(())
}

/// Node-agent client interface.
#[derive(Clone)]
pub struct AgentInterface {
    agent: Option<Arc<dyn ClusterAgent>>,
}

impl std::fmt::Debug for AgentInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInterface")
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl AgentInterface {
    pub fn new(agent: Arc<dyn ClusterAgent>) -> Self {
        Self { agent: Some(agent) }
    }

    /// An interface on which every operation fails.
    pub fn disabled() -> Self {
        Self { agent: None }
    }

    /// Build an interface for the given agent socket.
    ///
    /// `""` and `"disabled"` disable the interface, `"in-cluster"` talks to the
    /// API server directly and anything else is taken as a unix socket path.
    pub async fn connect(socket: &str, node_name: &str) -> Result<Self, AgentError> {
        match socket {
            "" | DISABLED_SOCKET => Ok(Self::disabled()),
            IN_CLUSTER_SOCKET => {
                let agent = KubeClusterAgent::in_cluster(node_name).await?;
                Ok(Self::new(Arc::new(agent)))
            }
            path => {
                let agent = GrpcClusterAgent::connect(path).await?;
                Ok(Self::new(Arc::new(agent)))
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.agent.is_none()
    }

    fn agent(&self) -> Result<&Arc<dyn ClusterAgent>, AgentError> {
        self.agent.as_ref().ok_or(AgentError::Disabled)
    }

    pub async fn get_node(&self, timeout: Option<Duration>) -> Result<Node, AgentError> {
        let agent = self.agent()?;
        with_timeout("get node", timeout, agent.get_node()).await
    }

    pub async fn patch_node(
        &self,
        patches: &[PatchOp],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        let agent = self.agent()?;
        if patches.is_empty() {
            return Ok(());
        }
        debug!(count = patches.len(), "Patching node");
        with_timeout("patch node", timeout, agent.patch_node(patches)).await
    }

    pub async fn update_node_capacity(
        &self,
        capacities: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        let agent = self.agent()?;
        if capacities.is_empty() {
            return Ok(());
        }
        validate_capacities(capacities)?;
        with_timeout(
            "update node capacity",
            timeout,
            agent.update_node_capacity(capacities),
        )
        .await
    }

    pub async fn get_config(&self, timeout: Option<Duration>) -> Result<RawConfig, AgentError> {
        let agent = self.agent()?;
        with_timeout("get config", timeout, agent.get_config()).await
    }

    pub async fn health_check(&self, timeout: Option<Duration>) -> Result<(), AgentError> {
        let agent = self.agent()?;
        with_timeout("health check", timeout, agent.health_check()).await
    }

    pub async fn get_labels(
        &self,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        let node = self.get_node(timeout).await?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    pub async fn set_labels(
        &self,
        labels: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.agent()?;
        if labels.is_empty() {
            return Ok(());
        }
        let node = self.get_node(timeout).await?;
        let patches = patch::set_labels(labels, node.metadata.labels.as_ref()).map_err(|e| {
            AgentError::Encode {
                what: "labels".to_string(),
                source: e,
            }
        })?;
        self.patch_node(&patches, timeout).await
    }

    pub async fn remove_labels<S: AsRef<str> + Sync>(
        &self,
        keys: &[S],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.remove_keys(MetadataClass::Labels, keys, timeout).await
    }

    pub async fn get_annotations(
        &self,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        let node = self.get_node(timeout).await?;
        Ok(node.metadata.annotations.unwrap_or_default())
    }

    /// Set annotations. Values must be marshaled JSON.
    pub async fn set_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.agent()?;
        if annotations.is_empty() {
            return Ok(());
        }
        let node = self.get_node(timeout).await?;
        let patches = patch::set_annotations(annotations, node.metadata.annotations.as_ref());
        self.patch_node(&patches, timeout).await
    }

    pub async fn remove_annotations<S: AsRef<str> + Sync>(
        &self,
        keys: &[S],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.remove_keys(MetadataClass::Annotations, keys, timeout)
            .await
    }

    async fn remove_keys<S: AsRef<str> + Sync>(
        &self,
        class: MetadataClass,
        keys: &[S],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.agent()?;
        if keys.is_empty() {
            return Ok(());
        }
        let node = self.get_node(timeout).await?;
        let live = match class {
            MetadataClass::Labels => node.metadata.labels.as_ref(),
            MetadataClass::Annotations => node.metadata.annotations.as_ref(),
        };
        let patches = patch::remove_keys(class, keys, live);
        self.patch_node(&patches, timeout).await
    }

    pub async fn get_taints(&self, timeout: Option<Duration>) -> Result<Vec<Taint>, AgentError> {
        let node = self.get_node(timeout).await?;
        Ok(node.spec.and_then(|s| s.taints).unwrap_or_default())
    }

    pub async fn set_taints(
        &self,
        taints: &[Taint],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.agent()?;
        if taints.is_empty() {
            return Ok(());
        }
        let node = self.get_node(timeout).await?;
        let live = node.spec.as_ref().and_then(|s| s.taints.as_deref());
        let patches = patch::set_taints(taints, live).map_err(|e| AgentError::Encode {
            what: "taints".to_string(),
            source: e,
        })?;
        self.patch_node(&patches, timeout).await
    }

    pub async fn remove_taints(
        &self,
        taints: &[Taint],
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.agent()?;
        if taints.is_empty() {
            return Ok(());
        }
        let node = self.get_node(timeout).await?;
        let live = node.spec.as_ref().and_then(|s| s.taints.as_deref());
        let patches = patch::remove_taints(taints, live);
        self.patch_node(&patches, timeout).await
    }

    pub fn find_taint_index(&self, taints: &[Taint], taint: &Taint) -> Option<usize> {
        patch::find_taint_index(taints, taint)
    }
}
