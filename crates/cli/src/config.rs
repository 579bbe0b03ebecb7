//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_URL: &str = "http://127.0.0.1:8891";
pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_RELAY_SOCKET: &str = "/var/run/resmgr/resmgr.sock";
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/resmgr";

/// CLI configuration, each field overridden by the matching flag
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Configuration push endpoint
    pub config_url: Option<String>,
    /// Health and metrics endpoint
    pub api_url: Option<String>,
    pub relay_socket: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// Node name stamped on pushed configuration
    pub node_name: Option<String>,
}

impl Config {
    /// Load configuration from the default location, if present
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("resmgr-ctl").join("config.json"))
    }

    pub fn config_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.config_url.clone())
            .unwrap_or_else(|| DEFAULT_CONFIG_URL.to_string())
    }

    pub fn api_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn relay_socket(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.relay_socket.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RELAY_SOCKET))
    }

    pub fn cache_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.cache_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }

    pub fn node_name(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.node_name.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"config_url": "http://10.0.0.1:8891", "cache_dir": "/tmp/resmgr"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.config_url(None), "http://10.0.0.1:8891");
        assert_eq!(
            config.config_url(Some("http://127.0.0.1:9000".to_string())),
            "http://127.0.0.1:9000"
        );
        assert_eq!(config.cache_dir(None), PathBuf::from("/tmp/resmgr"));
        assert_eq!(config.api_url(None), DEFAULT_API_URL);
        assert_eq!(config.relay_socket(None), PathBuf::from(DEFAULT_RELAY_SOCKET));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.config_url(None), DEFAULT_CONFIG_URL);
        assert_eq!(config.node_name(None), "");
    }
}
