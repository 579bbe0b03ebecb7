//! Container selector expressions
//!
//! Expressions select containers by comparing the value of a key against a
//! list of values. Keys may reference nested maps with `/` (for instance
//! `labels/app`); a bare key containing a `.` is looked up among the labels.
//! Joint keys of the form `:<ksep><vsep>key1<ksep>key2` (or `:key1:key2`)
//! concatenate several values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValidationError;

/// Well-known container keys
pub mod keys {
    pub const POD: &str = "pod";
    pub const ID: &str = "id";
    pub const UID: &str = "uid";
    pub const NAME: &str = "name";
    pub const NAMESPACE: &str = "namespace";
    pub const QOS_CLASS: &str = "qosclass";
    pub const LABELS: &str = "labels";
    pub const TAGS: &str = "tags";
}

/// Result of looking up a key on an evaluable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Value(String),
    Map(BTreeMap<String, String>),
}

/// Objects expressions can be evaluated against.
pub trait Evaluable: fmt::Debug {
    fn eval(&self, key: &str) -> Option<Resolved>;
}

impl Evaluable for BTreeMap<String, String> {
    fn eval(&self, key: &str) -> Option<Resolved> {
        self.get(key).cloned().map(Resolved::Value)
    }
}

/// Expression operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEqual,
    In,
    NotIn,
    Exists,
    NotExist,
    AlwaysTrue,
    Matches,
    MatchesNot,
    MatchesAny,
    MatchesNone,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single selector expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    pub key: String,
    #[serde(rename = "operator")]
    pub op: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Expression {
    pub fn new(key: impl Into<String>, op: Operator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            op,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Check the expression for obvious invalidity.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.op {
            Operator::Equals | Operator::NotEqual | Operator::Matches | Operator::MatchesNot => {
                if self.values.len() != 1 {
                    return Err(ValidationError::Expression(format!(
                        "'{}' requires a single value",
                        self.op
                    )));
                }
            }
            Operator::Exists | Operator::NotExist => {
                if !self.values.is_empty() {
                    return Err(ValidationError::Expression(format!(
                        "'{}' does not take any values",
                        self.op
                    )));
                }
            }
            Operator::MatchesAny | Operator::MatchesNone => {}
            Operator::In | Operator::NotIn | Operator::AlwaysTrue => {}
        }

        if matches!(
            self.op,
            Operator::Matches | Operator::MatchesNot | Operator::MatchesAny | Operator::MatchesNone
        ) {
            for pattern in &self.values {
                glob::Pattern::new(pattern).map_err(|e| {
                    ValidationError::Expression(format!("invalid pattern {:?}: {}", pattern, e))
                })?;
            }
        }

        Ok(())
    }

    /// Evaluate the expression against a subject.
    pub fn evaluate(&self, subject: &dyn Evaluable) -> bool {
        let value = self.key_value(subject);
        let first = self.values.first().map(String::as_str).unwrap_or_default();

        let result = match self.op {
            Operator::Equals => value
                .as_deref()
                .map(|v| v == first || first == "*")
                .unwrap_or(false),
            Operator::NotEqual => value.as_deref().map(|v| v != first).unwrap_or(true),
            Operator::Matches => value.as_deref().map(|v| glob_match(first, v)).unwrap_or(false),
            Operator::MatchesNot => !value.as_deref().map(|v| glob_match(first, v)).unwrap_or(false),
            Operator::In => self.is_in(value.as_deref()),
            Operator::NotIn => !self.is_in(value.as_deref()),
            Operator::MatchesAny => self.matches_any(value.as_deref()),
            Operator::MatchesNone => !self.matches_any(value.as_deref()),
            Operator::Exists => value.is_some(),
            Operator::NotExist => value.is_none(),
            Operator::AlwaysTrue => true,
        };

        tracing::trace!(expression = %self, subject = ?subject, result, "Evaluated expression");
        result
    }

    fn is_in(&self, value: Option<&str>) -> bool {
        match value {
            Some(value) => self.values.iter().any(|v| v == value || v == "*"),
            None => false,
        }
    }

    fn matches_any(&self, value: Option<&str>) -> bool {
        match value {
            Some(value) => self.values.iter().any(|p| glob_match(p, value)),
            None => false,
        }
    }

    /// Extract the value of the expression key, `None` if it does not resolve.
    pub fn key_value(&self, subject: &dyn Evaluable) -> Option<String> {
        let (keys, vsep) = split_keys(&self.key);
        if keys.len() == 1 {
            return resolve_ref(subject, keys[0]);
        }

        let mut found = false;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let v = resolve_ref(subject, key);
            found |= v.is_some();
            values.push(v.unwrap_or_default());
        }
        found.then(|| values.join(vsep))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {} {}>", self.key, self.op, self.values.join(","))
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(value))
        .unwrap_or(false)
}

fn valid_separator(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '/' || c == '.')
}

/// Split a possibly joint key into its parts and the value separator.
fn split_keys(key: &str) -> (Vec<&str>, &str) {
    if key.len() < 4 || !key.starts_with(':') || !key.is_ascii() {
        return (vec![key], "");
    }

    let rest = &key[1..];
    let ksep = &rest[0..1];
    let vsep = &rest[1..2];
    let ksep_char = ksep.chars().next().unwrap_or(':');
    let vsep_char = vsep.chars().next().unwrap_or(':');

    if valid_separator(ksep_char) && valid_separator(vsep_char) {
        (rest[2..].split(ksep).collect(), vsep)
    } else {
        (rest.split(':').collect(), ":")
    }
}

/// Walk a subject along a `/`-separated reference.
pub fn resolve_ref(subject: &dyn Evaluable, spec: &str) -> Option<String> {
    let spec = spec.trim_matches('/');
    let mut path: Vec<&str> = spec.split('/').filter(|s| !s.is_empty()).collect();
    if path.len() == 1 && spec.contains('.') {
        path = vec![keys::LABELS, spec];
    }

    let (first, rest) = path.split_first()?;
    let mut current = subject.eval(first)?;
    for key in rest {
        current = match current {
            Resolved::Map(map) => Resolved::Value(map.get(*key)?.clone()),
            Resolved::Value(_) => return None,
        };
    }

    match current {
        Resolved::Value(value) => Some(value),
        Resolved::Map(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Container {
        fields: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    }

    impl Evaluable for Container {
        fn eval(&self, key: &str) -> Option<Resolved> {
            if key == keys::LABELS {
                return Some(Resolved::Map(self.labels.clone()));
            }
            self.fields.get(key).cloned().map(Resolved::Value)
        }
    }

    fn container() -> Container {
        Container {
            fields: [("name", "web"), ("namespace", "prod"), ("qosclass", "Burstable")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            labels: [("app", "nginx"), ("example.com/tier", "front")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_equals_and_wildcard() {
        let c = container();
        assert!(Expression::new("name", Operator::Equals, &["web"]).evaluate(&c));
        assert!(Expression::new("name", Operator::Equals, &["*"]).evaluate(&c));
        assert!(!Expression::new("missing", Operator::Equals, &["*"]).evaluate(&c));
        assert!(Expression::new("missing", Operator::NotEqual, &["x"]).evaluate(&c));
    }

    #[test]
    fn test_in_and_not_in() {
        let c = container();
        assert!(Expression::new("namespace", Operator::In, &["dev", "prod"]).evaluate(&c));
        assert!(!Expression::new("namespace", Operator::NotIn, &["dev", "prod"]).evaluate(&c));
        assert!(Expression::new("missing", Operator::NotIn, &["a"]).evaluate(&c));
    }

    #[test]
    fn test_glob_operators() {
        let c = container();
        assert!(Expression::new("name", Operator::Matches, &["w*"]).evaluate(&c));
        assert!(Expression::new("name", Operator::MatchesNot, &["x*"]).evaluate(&c));
        assert!(Expression::new("name", Operator::MatchesAny, &["x*", "?eb"]).evaluate(&c));
        assert!(!Expression::new("name", Operator::MatchesNone, &["x*", "?eb"]).evaluate(&c));
    }

    #[test]
    fn test_existence() {
        let c = container();
        assert!(Expression::new("labels/app", Operator::Exists, &[]).evaluate(&c));
        assert!(Expression::new("labels/nope", Operator::NotExist, &[]).evaluate(&c));
        assert!(Expression::new("anything", Operator::AlwaysTrue, &[]).evaluate(&c));
    }

    #[test]
    fn test_dotted_key_resolves_label() {
        let c = container();
        assert_eq!(resolve_ref(&c, "example.com/tier").as_deref(), None);
        assert!(Expression::new("labels/app", Operator::Equals, &["nginx"]).evaluate(&c));

        let mut dotted = container();
        dotted.labels.insert("io.tier".into(), "gold".into());
        assert_eq!(resolve_ref(&dotted, "io.tier").as_deref(), Some("gold"));
    }

    #[test]
    fn test_joint_keys() {
        let c = container();
        let expr = Expression::new(":namespace:name", Operator::Equals, &["prod:web"]);
        assert!(expr.evaluate(&c));

        let expr = Expression::new(":,-namespace,name", Operator::Equals, &["prod-web"]);
        assert!(expr.evaluate(&c));

        // '/' is not a separator, so the whole thing is a single unknown key
        let expr = Expression::new(":,/namespace,name", Operator::Equals, &["prod/web"]);
        assert!(!expr.evaluate(&c));
    }

    #[test]
    fn test_validate() {
        assert!(Expression::new("a", Operator::Equals, &[]).validate().is_err());
        assert!(Expression::new("a", Operator::Exists, &["x"]).validate().is_err());
        assert!(Expression::new("a", Operator::MatchesAny, &["[x"]).validate().is_err());
        assert!(Expression::new("a", Operator::In, &[]).validate().is_ok());
    }

    #[test]
    fn test_json_shape() {
        let expr: Expression =
            serde_json::from_str(r#"{"key":"name","operator":"In","values":["a","b"]}"#).unwrap();
        assert_eq!(expr, Expression::new("name", Operator::In, &["a", "b"]));
    }
}
