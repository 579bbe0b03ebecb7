//! Core data models for the resource manager

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::expression::{Evaluable, Expression};

/// Raw configuration as pushed by the cluster agent or loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConfig {
    /// Name of the node the configuration was generated for
    #[serde(default)]
    pub node_name: String,
    /// Opaque configuration payload
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl RawConfig {
    pub fn new(node_name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            node_name: node_name.into(),
            data,
        }
    }

    /// Check if another configuration carries the same payload.
    pub fn has_identical_data(&self, other: &RawConfig) -> bool {
        self.data == other.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A set of named adjustments, applied wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Adjustment {
    pub specs: BTreeMap<String, AdjustmentSpec>,
}

impl Adjustment {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Verify every spec, collecting failures by adjustment name.
    pub fn verify(&self) -> BTreeMap<String, ValidationError> {
        self.specs
            .iter()
            .filter_map(|(name, spec)| spec.verify().err().map(|e| (name.clone(), e)))
            .collect()
    }

    /// Adjustments with at least one scope covering the node.
    pub fn for_node(&self, node: &str) -> Adjustment {
        Adjustment {
            specs: self
                .specs
                .iter()
                .filter(|(_, spec)| spec.is_node_in_scope(node))
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect(),
        }
    }
}

impl FromIterator<(String, AdjustmentSpec)> for Adjustment {
    fn from_iter<T: IntoIterator<Item = (String, AdjustmentSpec)>>(iter: T) -> Self {
        Adjustment {
            specs: iter.into_iter().collect(),
        }
    }
}

/// An externally authored override of container resources and classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentSpec {
    #[serde(default)]
    pub scope: Vec<AdjustmentScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Classes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toptier_limit: Option<Quantity>,
}

/// Nodes and containers an adjustment applies to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentScope {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub containers: Vec<Expression>,
}

/// Class assignments of an adjustment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classes {
    #[serde(default, rename = "blockio", skip_serializing_if = "Option::is_none")]
    pub block_io: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdt: Option<String>,
}

const RESOURCE_CPU: &str = "cpu";
const RESOURCE_MEMORY: &str = "memory";

impl AdjustmentSpec {
    /// Check the spec for obvious errors.
    pub fn verify(&self) -> Result<(), ValidationError> {
        self.verify_resources()?;
        self.verify_toptier_limit()?;
        for scope in &self.scope {
            for expr in &scope.containers {
                expr.validate()?;
            }
        }
        Ok(())
    }

    fn verify_resources(&self) -> Result<(), ValidationError> {
        let Some(resources) = &self.resources else {
            return Ok(());
        };
        let empty = BTreeMap::new();
        let requests = resources.requests.as_ref().unwrap_or(&empty);
        let limits = resources.limits.as_ref().unwrap_or(&empty);

        for resource in [RESOURCE_CPU, RESOURCE_MEMORY] {
            if let (Some(req), Some(lim)) = (requests.get(resource), limits.get(resource)) {
                if parse_quantity(lim)? < parse_quantity(req)? {
                    return Err(ValidationError::LimitBelowRequest {
                        resource: resource.to_string(),
                        limit: lim.0.clone(),
                        request: req.0.clone(),
                    });
                }
            }
        }

        for (kind, list) in [("requests", requests), ("limits", limits)] {
            if let Some(name) = list
                .keys()
                .find(|name| name.as_str() != RESOURCE_CPU && name.as_str() != RESOURCE_MEMORY)
            {
                return Err(ValidationError::UnsupportedResource {
                    kind,
                    name: name.clone(),
                });
            }
        }

        Ok(())
    }

    fn verify_toptier_limit(&self) -> Result<(), ValidationError> {
        if let Some(limit) = &self.toptier_limit {
            if parse_quantity(limit)? < 0.0 {
                return Err(ValidationError::NegativeToptierLimit(limit.0.clone()));
            }
        }
        Ok(())
    }

    /// Check if the node is within any scope. An empty scope list covers every node.
    pub fn is_node_in_scope(&self, node: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|s| s.is_node_in_scope(node))
    }

    /// Check if the container is within any scope.
    pub fn is_container_in_scope(&self, container: &dyn Evaluable) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|s| s.is_container_in_scope(container))
    }

    /// Scopes that apply to the given node.
    pub fn node_scope(&self, node: &str) -> Vec<&AdjustmentScope> {
        self.scope
            .iter()
            .filter(|s| s.is_node_in_scope(node))
            .collect()
    }
}

impl AdjustmentScope {
    pub fn is_node_in_scope(&self, node: &str) -> bool {
        self.nodes.is_empty() || self.nodes.iter().any(|n| node_matches(n, node))
    }

    pub fn is_container_in_scope(&self, container: &dyn Evaluable) -> bool {
        self.containers.is_empty() || self.containers.iter().any(|e| e.evaluate(container))
    }
}

/// Match a node name against a pattern with a single optional trailing `*`.
pub fn node_matches(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Parse a resource quantity into its numeric value.
pub fn parse_quantity(quantity: &Quantity) -> Result<f64, ValidationError> {
    let raw = quantity.0.trim();
    let invalid = || ValidationError::InvalidQuantity(quantity.0.clone());

    let split = raw
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let base: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..].parse().map_err(|_| invalid())?;
            10f64.powi(power)
        }
        _ => return Err(invalid()),
    };

    Ok(base * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn spec_with(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> AdjustmentSpec {
        AdjustmentSpec {
            resources: Some(ResourceRequirements {
                requests: Some(quantities(requests)),
                limits: Some(quantities(limits)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&Quantity("250m".into())).unwrap(), 0.25);
        assert_eq!(parse_quantity(&Quantity("2".into())).unwrap(), 2.0);
        assert_eq!(parse_quantity(&Quantity("1Gi".into())).unwrap(), 1073741824.0);
        assert_eq!(parse_quantity(&Quantity("1e3".into())).unwrap(), 1000.0);
        assert_eq!(parse_quantity(&Quantity("-1".into())).unwrap(), -1.0);
        assert!(parse_quantity(&Quantity("lots".into())).is_err());
        assert!(parse_quantity(&Quantity("1Qi".into())).is_err());
    }

    #[test]
    fn test_limit_below_request_rejected() {
        let spec = spec_with(&[("cpu", "2")], &[("cpu", "1500m")]);
        assert!(matches!(
            spec.verify(),
            Err(ValidationError::LimitBelowRequest { .. })
        ));

        let spec = spec_with(&[("memory", "1Gi")], &[("memory", "2Gi")]);
        assert!(spec.verify().is_ok());
    }

    #[test]
    fn test_unsupported_resource_rejected() {
        let spec = spec_with(&[("nvidia.com/gpu", "1")], &[]);
        assert_eq!(
            spec.verify(),
            Err(ValidationError::UnsupportedResource {
                kind: "requests",
                name: "nvidia.com/gpu".into()
            })
        );
    }

    #[test]
    fn test_negative_toptier_limit_rejected() {
        let spec = AdjustmentSpec {
            toptier_limit: Some(Quantity("-1Gi".into())),
            ..Default::default()
        };
        assert!(matches!(
            spec.verify(),
            Err(ValidationError::NegativeToptierLimit(_))
        ));
    }

    #[test]
    fn test_node_matches() {
        assert!(node_matches("", "node-1"));
        assert!(node_matches("node-*", "node-1"));
        assert!(node_matches("node-1", "node-1"));
        assert!(!node_matches("node-1", "node-12"));
        assert!(!node_matches("worker*", "node-1"));
    }

    #[test]
    fn test_adjustment_for_node() {
        let adjustment: Adjustment = serde_json::from_str(
            r#"{
                "all": {"scope": []},
                "workers": {"scope": [{"nodes": ["worker-*"]}]},
                "masters": {"scope": [{"nodes": ["master-*"]}]}
            }"#,
        )
        .unwrap();

        let scoped = adjustment.for_node("worker-3");
        assert_eq!(scoped.specs.keys().collect::<Vec<_>>(), vec!["all", "workers"]);
    }

    #[test]
    fn test_adjustment_verify_collects_per_name() {
        let mut adjustment = Adjustment::default();
        adjustment
            .specs
            .insert("good".into(), spec_with(&[("cpu", "1")], &[("cpu", "2")]));
        adjustment
            .specs
            .insert("bad".into(), spec_with(&[("cpu", "2")], &[("cpu", "1")]));

        let errors = adjustment.verify();
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("bad"));
    }

    #[test]
    fn test_spec_json_shape() {
        let spec: AdjustmentSpec = serde_json::from_str(
            r#"{
                "scope": [{"nodes": ["n*"], "containers": [{"key": "name", "operator": "Equals", "values": ["web"]}]}],
                "resources": {"requests": {"cpu": "500m"}, "limits": {"cpu": "1"}},
                "classes": {"blockio": "slow", "rdt": "gold"},
                "toptierLimit": "2Gi"
            }"#,
        )
        .unwrap();

        assert!(spec.verify().is_ok());
        assert_eq!(spec.classes.unwrap().block_io.as_deref(), Some("slow"));
        assert_eq!(spec.toptier_limit, Some(Quantity("2Gi".into())));
    }

    #[test]
    fn test_has_identical_data() {
        let data: BTreeMap<String, String> = [("policy".to_string(), "static".to_string())].into();
        let a = RawConfig::new("node-a", data.clone());
        let b = RawConfig::new("node-b", data);
        assert!(a.has_identical_data(&b));
        assert!(!a.has_identical_data(&RawConfig::default()));
    }
}
