//! Resource placement policies
//!
//! The placement algorithms themselves live outside this crate; what remains
//! here is the seam the resource manager drives and two builtin policies:
//! `none`, which accepts everything, and `static`, which honours reserved
//! resources and class assignments from its configuration.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{PolicyError, ResmgrError};
use crate::models::{parse_quantity, Adjustment, RawConfig};

pub const NONE_POLICY: &str = "none";
pub const STATIC_POLICY: &str = "static";

/// Configuration key holding the policy section.
pub const POLICY_CONFIG_KEY: &str = "policy";
/// Configuration key holding RDT class definitions.
pub const RDT_CONFIG_KEY: &str = "rdt";
/// Configuration key holding block I/O class definitions.
pub const BLOCKIO_CONFIG_KEY: &str = "blockio";

#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Activate a new configuration. A rejected configuration leaves the
    /// policy as it was.
    async fn update_config(&mut self, config: &RawConfig) -> Result<(), PolicyError>;

    /// Apply adjustments covering this node, returning failures by name.
    async fn apply_adjustment(&mut self, adjustment: &Adjustment) -> BTreeMap<String, PolicyError>;

    /// Drop all policy state.
    async fn reset(&mut self);

    /// Policy state worth persisting in the cache.
    fn export_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// The policy section of a configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicySection {
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    reserved_resources: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClassSection {
    #[serde(default)]
    classes: Vec<String>,
}

fn section<T: Default + serde::de::DeserializeOwned>(
    policy: &'static str,
    config: &RawConfig,
    key: &str,
) -> Result<T, PolicyError> {
    match config.data.get(key) {
        None => Ok(T::default()),
        Some(raw) => serde_yaml::from_str(raw).map_err(|e| PolicyError::InvalidConfig {
            policy,
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn policy_section(policy: &'static str, config: &RawConfig) -> Result<PolicySection, PolicyError> {
    let section: PolicySection = section(policy, config, POLICY_CONFIG_KEY)?;
    match section.active.as_deref() {
        Some(active) if !active.is_empty() && active != policy => Err(PolicyError::Rejected {
            policy,
            message: format!("cannot switch to policy {:?} without a restart", active),
        }),
        _ => Ok(section),
    }
}

/// Policy that leaves every container alone.
#[derive(Debug, Default)]
pub struct NonePolicy;

#[async_trait]
impl Policy for NonePolicy {
    fn name(&self) -> &'static str {
        NONE_POLICY
    }

    fn description(&self) -> &'static str {
        "A no-op policy, doing pretty much nothing."
    }

    async fn update_config(&mut self, config: &RawConfig) -> Result<(), PolicyError> {
        policy_section(NONE_POLICY, config).map(|_| ())
    }

    async fn apply_adjustment(&mut self, _adjustment: &Adjustment) -> BTreeMap<String, PolicyError> {
        BTreeMap::new()
    }

    async fn reset(&mut self) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct StaticState {
    reserved_cpu: f64,
    rdt_classes: BTreeSet<String>,
    blockio_classes: BTreeSet<String>,
    adjustments: BTreeSet<String>,
}

/// Policy with a fixed CPU reservation and known class sets.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    state: StaticState,
}

impl StaticPolicy {
    fn parse(config: &RawConfig) -> Result<StaticState, PolicyError> {
        let policy: PolicySection = policy_section(STATIC_POLICY, config)?;
        let rdt: ClassSection = section(STATIC_POLICY, config, RDT_CONFIG_KEY)?;
        let blockio: ClassSection = section(STATIC_POLICY, config, BLOCKIO_CONFIG_KEY)?;

        let reserved_cpu = match policy.reserved_resources.get("cpu") {
            None => 0.0,
            Some(quantity) => {
                let cpu = parse_quantity(quantity).map_err(|e| PolicyError::InvalidConfig {
                    policy: STATIC_POLICY,
                    key: POLICY_CONFIG_KEY.to_string(),
                    message: e.to_string(),
                })?;
                if cpu < 0.0 {
                    return Err(PolicyError::InvalidConfig {
                        policy: STATIC_POLICY,
                        key: POLICY_CONFIG_KEY.to_string(),
                        message: format!("negative CPU reservation {}", quantity.0),
                    });
                }
                cpu
            }
        };

        Ok(StaticState {
            reserved_cpu,
            rdt_classes: rdt.classes.into_iter().collect(),
            blockio_classes: blockio.classes.into_iter().collect(),
            adjustments: BTreeSet::new(),
        })
    }

    fn check_class(
        known: &BTreeSet<String>,
        kind: &str,
        class: Option<&String>,
    ) -> Result<(), PolicyError> {
        match class {
            Some(class) if !known.is_empty() && !known.contains(class) => {
                Err(PolicyError::Rejected {
                    policy: STATIC_POLICY,
                    message: format!("unknown {} class {:?}", kind, class),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Policy for StaticPolicy {
    fn name(&self) -> &'static str {
        STATIC_POLICY
    }

    fn description(&self) -> &'static str {
        "A simple policy with a fixed CPU reservation."
    }

    async fn update_config(&mut self, config: &RawConfig) -> Result<(), PolicyError> {
        let mut state = Self::parse(config)?;
        state.adjustments = std::mem::take(&mut self.state.adjustments);

        info!(
            reserved_cpu = state.reserved_cpu,
            rdt_classes = state.rdt_classes.len(),
            blockio_classes = state.blockio_classes.len(),
            "Static policy configured"
        );
        self.state = state;
        Ok(())
    }

    async fn apply_adjustment(&mut self, adjustment: &Adjustment) -> BTreeMap<String, PolicyError> {
        let mut errors = BTreeMap::new();
        for (name, spec) in &adjustment.specs {
            let classes = spec.classes.as_ref();
            let checked = Self::check_class(
                &self.state.rdt_classes,
                "RDT",
                classes.and_then(|c| c.rdt.as_ref()),
            )
            .and_then(|_| {
                Self::check_class(
                    &self.state.blockio_classes,
                    "block I/O",
                    classes.and_then(|c| c.block_io.as_ref()),
                )
            });
            if let Err(e) = checked {
                errors.insert(name.clone(), e);
            }
        }

        if errors.is_empty() {
            self.state.adjustments = adjustment.specs.keys().cloned().collect();
            debug!(adjustments = self.state.adjustments.len(), "Static policy adjusted");
        }
        errors
    }

    async fn reset(&mut self) {
        self.state = StaticState::default();
    }

    fn export_state(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }
}

/// The builtin policies and the one selected to run.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    active: &'static str,
}

impl PolicyRegistry {
    /// Names and descriptions of the builtin policies.
    pub fn available() -> Vec<(&'static str, &'static str)> {
        vec![
            (NONE_POLICY, NonePolicy.description()),
            (STATIC_POLICY, StaticPolicy::default().description()),
        ]
    }

    pub fn new(active: &str) -> Result<Self, ResmgrError> {
        Self::available()
            .into_iter()
            .find(|(name, _)| *name == active)
            .map(|(name, _)| Self { active: name })
            .ok_or_else(|| ResmgrError::UnknownPolicy(active.to_string()))
    }

    pub fn active_policy(&self) -> &'static str {
        self.active
    }

    /// Instantiate the active policy.
    pub fn create(&self) -> Box<dyn Policy> {
        match self.active {
            STATIC_POLICY => Box::new(StaticPolicy::default()),
            _ => Box::new(NonePolicy),
        }
    }
}
