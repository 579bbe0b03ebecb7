//! Error types shared by the control-plane components

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the cluster-agent client.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent-client: agent interface is disabled")]
    Disabled,

    #[error("agent-client: failed to connect to agent at {socket}: {message}")]
    Connect { socket: String, message: String },

    #[error("agent-client: {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("agent-client: failed to {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("agent-client: invalid response, {0}")]
    InvalidResponse(String),

    #[error("agent-client: failed to marshal {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("agent-client: {0}")]
    InvalidCapacity(String),

    #[error("agent-client: node name is not set")]
    MissingNodeName,
}

impl AgentError {
    pub(crate) fn transport(operation: &'static str, err: impl std::fmt::Display) -> Self {
        AgentError::Transport {
            operation,
            message: err.to_string(),
        }
    }
}

/// Failures of an adjustment spec verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("adjustment API error: invalid {resource} limit {limit:?} < request {request:?}")]
    LimitBelowRequest {
        resource: String,
        limit: String,
        request: String,
    },

    #[error("adjustment API error: invalid resource {kind}: unsupported resource {name}")]
    UnsupportedResource { kind: &'static str, name: String },

    #[error("adjustment API error: invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("adjustment API error: invalid ToptierLimit {0}")]
    NegativeToptierLimit(String),

    #[error("invalid expression, {0}")]
    Expression(String),
}

/// Failures while reading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration file {path}: {message}")]
    File { path: PathBuf, message: String },

    #[error("configuration rejected: {0}")]
    Rejected(String),

    #[error("failed to decode adjustment: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("config-server: {0}")]
    Server(String),
}

/// Failures of the persistent cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache: failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache: corrupt cache file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the runtime relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cri/relay: failed to connect to runtime at {socket}: {message}")]
    Connect { socket: String, message: String },

    #[error("cri/relay: failed to set up relay socket {socket}: {source}")]
    Socket {
        socket: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cri/relay: failed to create container event client: {0}")]
    EventStream(tonic::Status),
}

/// Failures of a watch source.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch: failed to open {target}: {message}")]
    Open { target: String, message: String },

    #[error("watch: failed to query {target}: {message}")]
    Query { target: String, message: String },
}

/// Failures reported by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy {policy}: invalid configuration {key:?}: {message}")]
    InvalidConfig {
        policy: &'static str,
        key: String,
        message: String,
    },

    #[error("policy {policy}: {message}")]
    Rejected {
        policy: &'static str,
        message: String,
    },
}

/// Orchestrator-level failures.
#[derive(Debug, Error)]
pub enum ResmgrError {
    #[error("resource-manager: both fallback ({fallback}) and forced ({forced}) configurations given")]
    ConflictingConfigSources { forced: String, fallback: String },

    #[error("resource-manager: failed to load forced configuration {path}: {source}")]
    ForcedConfig {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("resource-manager: failed to load fallback configuration {path}: {source}")]
    FallbackConfig {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("resource-manager: invalid forced configuration reload signal '{0}'")]
    InvalidSignal(String),

    #[error("resource-manager: cannot load cache with policy {cached} for active policy {active}")]
    PolicySwitchDisabled { cached: String, active: String },

    #[error("resource-manager: unknown policy {0:?}")]
    UnknownPolicy(String),

    #[error("resource-manager: failed to activate {kind} configuration: {message}")]
    Activate { kind: &'static str, message: String },

    #[error("resource-manager: {0}")]
    Cache(#[from] CacheError),

    #[error("resource-manager: {0}")]
    Policy(#[from] PolicyError),

    #[error("resource-manager: {0}")]
    Relay(#[from] RelayError),

    #[error("resource-manager: {0}")]
    Config(#[from] ConfigError),

    #[error("resource-manager: {0}")]
    Agent(#[from] AgentError),

    #[error("resource-manager: failed to set up signal handler: {0}")]
    Signal(#[source] std::io::Error),
}
