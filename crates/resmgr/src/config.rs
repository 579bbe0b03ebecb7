//! Daemon settings

use anyhow::{Context, Result};
use resmgr_lib::relay::{socket_path, RelayOptions};
use resmgr_lib::ResmgrOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional settings file.
pub const SETTINGS_FILE_ENV: &str = "RESMGR_SETTINGS_FILE";

/// Daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Socket the relay serves the runtime interface on
    #[serde(default = "default_relay_socket")]
    pub relay_socket: String,

    #[serde(default = "default_runtime_socket")]
    pub runtime_socket: String,

    /// Image service socket, the runtime socket if empty
    #[serde(default)]
    pub image_socket: String,

    /// Cluster agent socket, `disabled` or `in-cluster`
    #[serde(default = "default_agent_socket")]
    pub agent_socket: String,

    /// Address of the configuration push endpoint
    #[serde(default = "default_config_listen")]
    pub config_listen: String,

    /// Port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub force_config: String,

    #[serde(default = "default_force_config_signal")]
    pub force_config_signal: String,

    #[serde(default)]
    pub fallback_config: String,

    #[serde(default)]
    pub disable_policy_switch: bool,

    #[serde(default = "default_policy")]
    pub policy: String,

    #[serde(default)]
    pub dump_requests: bool,

    /// Timeout of startup agent queries in milliseconds
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

fn default_relay_socket() -> String {
    "/var/run/resmgr/resmgr.sock".to_string()
}

fn default_runtime_socket() -> String {
    "/var/run/containerd/containerd.sock".to_string()
}

fn default_agent_socket() -> String {
    "/var/run/resmgr/resmgr-agent.sock".to_string()
}

fn default_config_listen() -> String {
    "127.0.0.1:8891".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/resmgr")
}

fn default_force_config_signal() -> String {
    "SIGHUP".to_string()
}

fn default_policy() -> String {
    "none".to_string()
}

fn default_agent_timeout_ms() -> u64 {
    1000
}

fn unix_path(socket: &str) -> PathBuf {
    PathBuf::from(socket.trim_start_matches("unix://"))
}

impl Settings {
    /// Load settings from the environment and the optional settings file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(file) = std::env::var(SETTINGS_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&file));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("RESMGR"))
            .build()
            .context("failed to read settings")?;

        config
            .try_deserialize()
            .context("failed to parse settings")
    }

    /// Resource manager options for these settings
    pub fn resmgr_options(&self) -> ResmgrOptions {
        ResmgrOptions {
            node_name: self.node_name.clone(),
            relay: RelayOptions {
                relay_socket: unix_path(&self.relay_socket),
                runtime_socket: unix_path(&self.runtime_socket),
                image_socket: socket_path(self.image_socket.trim_start_matches("unix://")),
                dump_requests: self.dump_requests,
                node_name: self.node_name.clone(),
            },
            config_listen: self.config_listen.clone(),
            cache_dir: self.cache_dir.clone(),
            force_config: socket_path(&self.force_config),
            force_config_signal: self.force_config_signal.clone(),
            fallback_config: socket_path(&self.fallback_config),
            disable_policy_switch: self.disable_policy_switch,
            policy: self.policy.clone(),
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
        }
    }
}
