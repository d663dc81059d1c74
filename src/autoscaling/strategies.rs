//! Built-in scaling policies

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CustomMetricConfig, MetricDirection, MetricsCollector, Recommendation, ScalingConfig,
    ScalingError, ScalingStrategy,
};
use crate::registry::Named;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const COMPOSITE: &str = "composite";
pub const CUSTOM_METRIC: &str = "custom-metric";

/// Threshold arithmetic shared by the utilization strategies
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    default_target: f64,
    up_margin: f64,
    up_step: f64,
    down_margin: f64,
    down_step: f64,
}

const CPU_THRESHOLDS: Thresholds = Thresholds {
    default_target: 70.0,
    up_margin: 10.0,
    up_step: 20.0,
    down_margin: 20.0,
    down_step: 25.0,
};

const MEMORY_THRESHOLDS: Thresholds = Thresholds {
    default_target: 75.0,
    up_margin: 10.0,
    up_step: 15.0,
    down_margin: 25.0,
    down_step: 20.0,
};

impl Thresholds {
    fn target(&self, configured: Option<f64>) -> f64 {
        match configured {
            Some(t) if t > 0.0 => t,
            _ => self.default_target,
        }
    }

    fn scale_up(&self, utilization: f64, target: f64, max_nodes: u32) -> Recommendation {
        if utilization <= target + self.up_margin {
            return Recommendation::none();
        }
        let nodes = ((utilization - target) / self.up_step).floor() as u32 + 1;
        Recommendation::nodes(nodes.min(max_nodes))
    }

    fn scale_down(&self, utilization: f64, target: f64) -> Recommendation {
        if utilization >= target - self.down_margin {
            return Recommendation::none();
        }
        let nodes = ((target - utilization) / self.down_step).floor() as u32;
        Recommendation::nodes(nodes.max(1))
    }
}

// ============================================================================
// CPU
// ============================================================================

/// Scales on cluster CPU utilization (target default 70%)
#[derive(Debug, Clone, Default)]
pub struct CpuStrategy;

impl CpuStrategy {
    pub fn recommend_up(utilization: f64, config: &ScalingConfig) -> Recommendation {
        let target = CPU_THRESHOLDS.target(config.target_cpu_utilization);
        CPU_THRESHOLDS.scale_up(utilization, target, config.max_nodes)
    }

    pub fn recommend_down(utilization: f64, config: &ScalingConfig) -> Recommendation {
        let target = CPU_THRESHOLDS.target(config.target_cpu_utilization);
        CPU_THRESHOLDS.scale_down(utilization, target)
    }
}

impl Named for CpuStrategy {
    fn name(&self) -> &str {
        CPU
    }
}

#[async_trait]
impl ScalingStrategy for CpuStrategy {
    async fn should_scale_up(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled {
            return Ok(Recommendation::none());
        }
        let utilization = metrics.cpu_utilization().await?;
        Ok(Self::recommend_up(utilization, config))
    }

    async fn should_scale_down(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled {
            return Ok(Recommendation::none());
        }
        let utilization = metrics.cpu_utilization().await?;
        Ok(Self::recommend_down(utilization, config))
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Scales on cluster memory utilization (target default 75%)
#[derive(Debug, Clone, Default)]
pub struct MemoryStrategy;

impl MemoryStrategy {
    pub fn recommend_up(utilization: f64, config: &ScalingConfig) -> Recommendation {
        let target = MEMORY_THRESHOLDS.target(config.target_memory_utilization);
        MEMORY_THRESHOLDS.scale_up(utilization, target, config.max_nodes)
    }

    pub fn recommend_down(utilization: f64, config: &ScalingConfig) -> Recommendation {
        let target = MEMORY_THRESHOLDS.target(config.target_memory_utilization);
        MEMORY_THRESHOLDS.scale_down(utilization, target)
    }
}

impl Named for MemoryStrategy {
    fn name(&self) -> &str {
        MEMORY
    }
}

#[async_trait]
impl ScalingStrategy for MemoryStrategy {
    async fn should_scale_up(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled {
            return Ok(Recommendation::none());
        }
        let utilization = metrics.memory_utilization().await?;
        Ok(Self::recommend_up(utilization, config))
    }

    async fn should_scale_down(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled {
            return Ok(Recommendation::none());
        }
        let utilization = metrics.memory_utilization().await?;
        Ok(Self::recommend_down(utilization, config))
    }
}

// ============================================================================
// Composite
// ============================================================================

/// Combines sub-strategies
///
/// Scale up if any sub-strategy wants to (largest delta wins). Scale down
/// only if every sub-strategy agrees (smallest delta wins).
pub struct CompositeStrategy {
    strategies: Vec<Arc<dyn ScalingStrategy>>,
}

impl CompositeStrategy {
    pub fn new(strategies: Vec<Arc<dyn ScalingStrategy>>) -> Self {
        Self { strategies }
    }
}

impl Default for CompositeStrategy {
    fn default() -> Self {
        Self::new(vec![Arc::new(CpuStrategy), Arc::new(MemoryStrategy)])
    }
}

impl Named for CompositeStrategy {
    fn name(&self) -> &str {
        COMPOSITE
    }
}

#[async_trait]
impl ScalingStrategy for CompositeStrategy {
    async fn should_scale_up(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled {
            return Ok(Recommendation::none());
        }

        let mut best: Option<u32> = None;
        for strategy in &self.strategies {
            let rec = strategy.should_scale_up(metrics, config).await?;
            if rec.scale {
                best = Some(best.map_or(rec.nodes, |n| n.max(rec.nodes)));
            }
        }

        Ok(best.map(Recommendation::nodes).unwrap_or_default())
    }

    async fn should_scale_down(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled || self.strategies.is_empty() {
            return Ok(Recommendation::none());
        }

        let mut smallest = u32::MAX;
        for strategy in &self.strategies {
            let rec = strategy.should_scale_down(metrics, config).await?;
            if !rec.scale {
                return Ok(Recommendation::none());
            }
            smallest = smallest.min(rec.nodes);
        }

        Ok(Recommendation::nodes(smallest))
    }
}

// ============================================================================
// Custom metric
// ============================================================================

/// Single-direction policy on a named external metric, one node at a time
#[derive(Debug, Clone)]
pub struct CustomMetricStrategy {
    metric: String,
    threshold: f64,
    direction: MetricDirection,
}

impl CustomMetricStrategy {
    pub fn new(metric: impl Into<String>, threshold: f64, direction: MetricDirection) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            direction,
        }
    }

    pub fn from_config(config: &CustomMetricConfig) -> Self {
        Self::new(config.name.clone(), config.threshold, config.direction)
    }
}

impl Named for CustomMetricStrategy {
    fn name(&self) -> &str {
        CUSTOM_METRIC
    }
}

#[async_trait]
impl ScalingStrategy for CustomMetricStrategy {
    async fn should_scale_up(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled || self.direction != MetricDirection::ScaleUp {
            return Ok(Recommendation::none());
        }
        let value = metrics.custom_metric(&self.metric).await?;
        if value > self.threshold {
            Ok(Recommendation::nodes(1))
        } else {
            Ok(Recommendation::none())
        }
    }

    async fn should_scale_down(
        &self,
        metrics: &dyn MetricsCollector,
        config: &ScalingConfig,
    ) -> Result<Recommendation, ScalingError> {
        if !config.enabled || self.direction != MetricDirection::ScaleDown {
            return Ok(Recommendation::none());
        }
        let value = metrics.custom_metric(&self.metric).await?;
        if value < self.threshold {
            Ok(Recommendation::nodes(1))
        } else {
            Ok(Recommendation::none())
        }
    }
}
