//! Configuration sources and the configuration push endpoint
//!
//! Forced and fallback configurations come from YAML or JSON files whose
//! top-level keys become the configuration map. Pushed configuration and
//! adjustments arrive through [`ConfigServer`].

mod server;

pub use server::{
    router, ConfigHandler, ConfigServer, SetAdjustmentReply, SetConfigReply, SetConfigRequest,
    DISABLED_LISTEN,
};

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::models::RawConfig;

/// Load a configuration file into a raw configuration for `node_name`.
pub fn load_config_file(path: impl AsRef<Path>, node_name: &str) -> Result<RawConfig, ConfigError> {
    let path = path.as_ref();
    let err = |message: String| ConfigError::File {
        path: path.to_path_buf(),
        message,
    };

    let content = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    let data = parse_config(&content).map_err(err)?;

    Ok(RawConfig::new(node_name, data))
}

/// Flatten a YAML or JSON document into a string map.
pub fn parse_config(content: &str) -> Result<BTreeMap<String, String>, String> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("invalid document: {}", e))?;

    let mapping = match document {
        serde_yaml::Value::Null => return Ok(BTreeMap::new()),
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => return Err("top level of configuration must be a map".to_string()),
    };

    let mut data = BTreeMap::new();
    for (key, value) in mapping {
        let key = scalar_string(&key)
            .ok_or_else(|| format!("invalid configuration key {:?}", key))?;
        let value = match scalar_string(&value) {
            Some(value) => value,
            None => serde_json::to_string(&value)
                .map_err(|e| format!("failed to encode value of {}: {}", key, e))?,
        };
        data.insert(key, value);
    }

    Ok(data)
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}
