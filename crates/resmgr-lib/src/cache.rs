//! Persistent resource manager state
//!
//! The cache outlives restarts: it remembers the policy that owned the
//! state, opaque per-policy data, the last configuration pushed by the agent
//! and the current adjustments. Everything is kept in one JSON file under the
//! cache directory and rewritten atomically on every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::models::{Adjustment, RawConfig};

/// Name of the cache file inside the cache directory.
pub const CACHE_FILE: &str = "cache.json";

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    #[serde(default)]
    active_policy: String,
    #[serde(default)]
    policy_data: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<RawConfig>,
    #[serde(default)]
    adjustments: Adjustment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
}

/// JSON-persisted cache.
#[derive(Debug)]
pub struct Cache {
    path: PathBuf,
    snapshot: Snapshot,
}

impl Cache {
    /// Open the cache in `cache_dir`, loading previously saved state.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = cache_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(CACHE_FILE);
        let snapshot = if path.exists() {
            let data = std::fs::read(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: Snapshot =
                serde_json::from_slice(&data).map_err(|source| CacheError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            info!(
                path = %path.display(),
                policy = %snapshot.active_policy,
                "Loaded cached state"
            );
            snapshot
        } else {
            Snapshot {
                version: CACHE_VERSION,
                ..Default::default()
            }
        };

        Ok(Self { path, snapshot })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Policy the cached state belongs to, empty if none.
    pub fn active_policy(&self) -> &str {
        &self.snapshot.active_policy
    }

    pub fn set_active_policy(&mut self, policy: &str) -> Result<(), CacheError> {
        self.snapshot.active_policy = policy.to_string();
        self.save()
    }

    /// Forget the active policy along with all of its data.
    pub fn reset_active_policy(&mut self) -> Result<(), CacheError> {
        self.snapshot.active_policy.clear();
        self.snapshot.policy_data.clear();
        self.save()
    }

    pub fn policy_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.snapshot.policy_data.get(key)
    }

    pub fn set_policy_data(&mut self, key: &str, value: serde_json::Value) -> Result<(), CacheError> {
        self.snapshot.policy_data.insert(key.to_string(), value);
        self.save()
    }

    /// Last configuration stored from the agent.
    pub fn config(&self) -> Option<&RawConfig> {
        self.snapshot.config.as_ref()
    }

    pub fn set_config(&mut self, config: &RawConfig) -> Result<(), CacheError> {
        self.snapshot.config = Some(config.clone());
        self.save()
    }

    pub fn reset_config(&mut self) -> Result<(), CacheError> {
        self.snapshot.config = None;
        self.save()
    }

    pub fn adjustments(&self) -> &Adjustment {
        &self.snapshot.adjustments
    }

    pub fn set_adjustments(&mut self, adjustments: &Adjustment) -> Result<(), CacheError> {
        self.snapshot.adjustments = adjustments.clone();
        self.save()
    }

    /// Write the cache through a temporary file.
    pub fn save(&mut self) -> Result<(), CacheError> {
        self.snapshot.version = CACHE_VERSION;
        self.snapshot.saved_at = Some(Utc::now());

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };

        let data = serde_json::to_vec_pretty(&self.snapshot).map_err(|source| {
            CacheError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(io_err(&temp_path))?;
        file.write_all(&data).map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;

        std::fs::rename(&temp_path, &self.path).map_err(io_err(&self.path))?;

        debug!(path = %self.path.display(), "Cache saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AdjustmentSpec;

    #[test]
    fn test_fresh_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();

        assert_eq!(cache.active_policy(), "");
        assert!(cache.config().is_none());
        assert!(cache.adjustments().is_empty());
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = RawConfig::new(
            "node-1",
            BTreeMap::from([("policy".to_string(), "static".to_string())]),
        );
        let adjustments: Adjustment =
            [("a1".to_string(), AdjustmentSpec::default())].into_iter().collect();

        {
            let mut cache = Cache::open(dir.path()).unwrap();
            cache.set_active_policy("static").unwrap();
            cache
                .set_policy_data("static", serde_json::json!({"reserved": 2}))
                .unwrap();
            cache.set_config(&config).unwrap();
            cache.set_adjustments(&adjustments).unwrap();
        }

        let cache = Cache::open(dir.path()).unwrap();
        assert_eq!(cache.active_policy(), "static");
        assert_eq!(
            cache.policy_data("static"),
            Some(&serde_json::json!({"reserved": 2}))
        );
        assert_eq!(cache.config(), Some(&config));
        assert_eq!(cache.adjustments(), &adjustments);
    }

    #[test]
    fn test_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();
        cache.set_active_policy("static").unwrap();
        cache.set_policy_data("static", serde_json::json!([1])).unwrap();
        cache
            .set_config(&RawConfig::new("node-1", BTreeMap::new()))
            .unwrap();

        cache.reset_active_policy().unwrap();
        assert_eq!(cache.active_policy(), "");
        assert!(cache.policy_data("static").is_none());
        assert!(cache.config().is_some());

        cache.reset_config().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        assert!(cache.config().is_none());
    }

    #[test]
    fn test_corrupt_cache_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), b"{not json").unwrap();

        let err = Cache::open(dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }
}
