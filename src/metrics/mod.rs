//! Host metrics for the autoscaler
//!
//! CPU and memory come from `sysinfo`. Custom metrics are gauges pushed by
//! whatever knows about them (queue depth exporters, the API, tests).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use sysinfo::System;
use tracing::trace;

use crate::autoscaling::{MetricsCollector, MetricsError};

/// Metrics collector for the host the control plane runs on
pub struct SystemMetricsCollector {
    system: Mutex<System>,
    gauges: DashMap<String, f64>,
}

impl SystemMetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; take the first sample now
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            gauges: DashMap::new(),
        }
    }

    /// Set or replace a custom gauge
    pub fn set_gauge(&self, name: impl Into<String>, value: f64) {
        self.gauges.insert(name.into(), value);
    }

    pub fn remove_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.remove(name).map(|(_, v)| v)
    }

    pub fn gauge_names(&self) -> Vec<String> {
        self.gauges.iter().map(|g| g.key().clone()).collect()
    }

    fn with_system<R>(&self, f: impl FnOnce(&mut System) -> R) -> R {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut system)
    }
}

impl Default for SystemMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Used memory as a percentage of total
pub fn memory_percent(used: u64, total: u64) -> Result<f64, MetricsError> {
    if total == 0 {
        return Err(MetricsError::Unavailable(
            "total memory reported as zero".to_string(),
        ));
    }
    Ok(used as f64 / total as f64 * 100.0)
}

#[async_trait]
impl MetricsCollector for SystemMetricsCollector {
    async fn cpu_utilization(&self) -> Result<f64, MetricsError> {
        let usage = self.with_system(|system| {
            system.refresh_cpu_usage();
            system.global_cpu_usage() as f64
        });
        trace!("CPU utilization {:.1}%", usage);
        Ok(usage)
    }

    async fn memory_utilization(&self) -> Result<f64, MetricsError> {
        let (used, total) = self.with_system(|system| {
            system.refresh_memory();
            (system.used_memory(), system.total_memory())
        });
        let usage = memory_percent(used, total)?;
        trace!("Memory utilization {:.1}%", usage);
        Ok(usage)
    }

    async fn custom_metric(&self, name: &str) -> Result<f64, MetricsError> {
        self.gauges
            .get(name)
            .map(|v| *v)
            .ok_or_else(|| MetricsError::UnknownMetric(name.to_string()))
    }
}

/// Shared collector for the autoscaler and API
pub type SharedMetricsCollector = Arc<SystemMetricsCollector>;

pub fn new_shared_collector() -> SharedMetricsCollector {
    Arc::new(SystemMetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_metrics_are_percentages() {
        let collector = SystemMetricsCollector::new();
        let cpu = collector.cpu_utilization().await.unwrap();
        assert!((0.0..=100.0).contains(&cpu));
        let mem = collector.memory_utilization().await.unwrap();
        assert!((0.0..=100.0).contains(&mem));
    }

    #[tokio::test]
    async fn test_custom_gauges() {
        let collector = SystemMetricsCollector::new();
        assert_eq!(
            collector.custom_metric("queue_depth").await,
            Err(MetricsError::UnknownMetric("queue_depth".into()))
        );

        collector.set_gauge("queue_depth", 42.0);
        assert_eq!(collector.custom_metric("queue_depth").await, Ok(42.0));
        assert_eq!(collector.gauge_names(), vec!["queue_depth"]);

        assert_eq!(collector.remove_gauge("queue_depth"), Some(42.0));
        assert!(collector.custom_metric("queue_depth").await.is_err());
    }

    #[test]
    fn test_memory_percent() {
        assert_eq!(memory_percent(512, 1024).unwrap(), 50.0);
        assert!(matches!(
            memory_percent(1, 0),
            Err(MetricsError::Unavailable(_))
        ));
    }
}
