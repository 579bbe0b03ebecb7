//! Node resource manager library
//!
//! This crate provides the control plane sitting between the node agent and
//! the container runtime:
//! - Transparent runtime relay with shared container event fan-out
//! - Node label, annotation, taint and capacity updates through the cluster agent
//! - Reconnecting watches over cluster objects
//! - Configuration and adjustment acquisition, validation and application
//! - Health checks and observability

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod expression;
pub mod health;
pub mod models;
pub mod observability;
pub mod patch;
pub mod policy;
pub mod proto;
pub mod relay;
pub mod resmgr;
pub mod watch;

pub use agent::AgentInterface;
pub use error::{
    AgentError, CacheError, ConfigError, PolicyError, RelayError, ResmgrError, ValidationError,
    WatchError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ResmgrMetrics, StructuredLogger};
pub use resmgr::{ConfigSource, ResmgrOptions, ResmgrStatus, ResourceManager};
