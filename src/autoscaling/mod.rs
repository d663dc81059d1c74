//! Node autoscaling
//!
//! The autoscaler periodically reads utilization from a [`MetricsCollector`],
//! asks the configured [`ScalingStrategy`] whether the node pool should grow
//! or shrink, and applies the result through a [`CloudProvisioner`].
//!
//! Strategies only recommend deltas. Global invariants are enforced by the
//! [`AutoscalingEngine`]: min/max node bounds and a cooldown window that
//! suppresses scale operations shortly after the previous one.

pub mod engine;
pub mod strategies;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::placement::{PlacementError, ZoneDistributionPlan};
use crate::registry::{Named, RegistryError};

pub use engine::{spawn_autoscaler, AutoscalerState, AutoscalingEngine, DEFAULT_ZONE};
pub use strategies::{
    CompositeStrategy, CpuStrategy, CustomMetricStrategy, MemoryStrategy, COMPOSITE, CPU,
    CUSTOM_METRIC, MEMORY,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors from metric collection (transient by nature)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Metrics unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),
}

/// Errors from the cloud provisioner collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvisionError {
    #[error("Provisioning failed: {0}")]
    Failed(String),

    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),
}

/// Errors from the autoscaling engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScalingError {
    #[error("Autoscaling is disabled")]
    Disabled,

    #[error("Scaling suppressed by cooldown ({0}s remaining)")]
    CooldownActive(u64),

    #[error("Another scale operation is in progress")]
    ScaleInProgress,

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Source of utilization readings
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Cluster CPU utilization percentage
    async fn cpu_utilization(&self) -> Result<f64, MetricsError>;

    /// Cluster memory utilization percentage
    async fn memory_utilization(&self) -> Result<f64, MetricsError>;

    /// Value of a named external metric
    async fn custom_metric(&self, name: &str) -> Result<f64, MetricsError>;
}

/// Creates and removes cluster nodes
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    async fn current_node_count(&self) -> Result<u32, ProvisionError>;

    /// Create nodes according to a zone placement. Returns the new node names.
    async fn provision_nodes(
        &self,
        placement: &ZoneDistributionPlan,
    ) -> Result<Vec<String>, ProvisionError>;

    /// Remove `count` nodes. Returns the removed node names.
    async fn decommission_nodes(&self, count: u32) -> Result<Vec<String>, ProvisionError>;
}

/// A scaling policy
#[async_trait]
pub trait ScalingStrategy: Named + Send + Sync {
    async fn should_scale_up(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError>;

    async fn should_scale_down(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError>;
}

// ============================================================================
// Data
// ============================================================================

/// A strategy's answer: whether to scale, and by how many nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Recommendation {
    pub scale: bool,
    pub nodes: u32,
}

impl Recommendation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn nodes(nodes: u32) -> Self {
        Self { scale: true, nodes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
    None,
}

/// Outcome of one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingDecision {
    pub direction: ScaleDirection,
    pub node_count: u32,
    pub reason: String,
}

impl ScalingDecision {
    pub fn up(node_count: u32, reason: impl Into<String>) -> Self {
        Self {
            direction: ScaleDirection::Up,
            node_count,
            reason: reason.into(),
        }
    }

    pub fn down(node_count: u32, reason: impl Into<String>) -> Self {
        Self {
            direction: ScaleDirection::Down,
            node_count,
            reason: reason.into(),
        }
    }

    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            direction: ScaleDirection::None,
            node_count: 0,
            reason: reason.into(),
        }
    }

    pub fn is_change(&self) -> bool {
        self.direction != ScaleDirection::None && self.node_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricDirection {
    /// Add a node when the metric rises above the threshold
    ScaleUp,
    /// Remove a node when the metric falls below the threshold
    ScaleDown,
}

/// External metric driving the custom-metric strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetricConfig {
    pub name: String,
    pub threshold: f64,
    pub direction: MetricDirection,
}

/// Autoscaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_min_nodes")]
    pub min_nodes: u32,

    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,

    /// Target CPU utilization (default: 70)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization: Option<f64>,

    /// Target memory utilization (default: 75)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory_utilization: Option<f64>,

    /// Strategy name: cpu, memory, composite, custom-metric
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Minimum seconds between two scale operations
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    /// How often the background loop evaluates
    #[serde(default = "default_interval")]
    pub evaluation_interval_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metric: Option<CustomMetricConfig>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_nodes: default_min_nodes(),
            max_nodes: default_max_nodes(),
            target_cpu_utilization: None,
            target_memory_utilization: None,
            strategy: default_strategy(),
            cooldown_seconds: default_cooldown(),
            evaluation_interval_seconds: default_interval(),
            custom_metric: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_min_nodes() -> u32 {
    1
}

fn default_max_nodes() -> u32 {
    10
}

fn default_strategy() -> String {
    COMPOSITE.to_string()
}

fn default_cooldown() -> u64 {
    300
}

fn default_interval() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_config_defaults() {
        let config: ScalingConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.min_nodes, 1);
        assert_eq!(config.max_nodes, 10);
        assert_eq!(config.strategy, "composite");
        assert_eq!(config.cooldown_seconds, 300);
        assert!(config.target_cpu_utilization.is_none());
    }

    #[test]
    fn test_custom_metric_config_deserialize() {
        let json = r#"{
            "strategy": "custom-metric",
            "customMetric": {"name": "queue_depth", "threshold": 100.0, "direction": "scale-up"}
        }"#;
        let config: ScalingConfig = serde_json::from_str(json).unwrap();
        let custom = config.custom_metric.unwrap();
        assert_eq!(custom.name, "queue_depth");
        assert_eq!(custom.direction, MetricDirection::ScaleUp);
    }

    #[test]
    fn test_decision_serialization() {
        let decision = ScalingDecision::up(2, "cpu high");
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["direction"], "up");
        assert_eq!(json["nodeCount"], 2);
        assert!(decision.is_change());
        assert!(!ScalingDecision::none("idle").is_change());
    }
}
