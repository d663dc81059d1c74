//! Control-plane configuration
//!
//! One file (YAML or JSON) with a section per service. Every field has a
//! default, so an empty document is a valid configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::autoscaling::ScalingConfig;
use crate::hooks::{resolve_executor_kind, HooksConfig};
use crate::placement::{PlacementConfig, ZoneDistributor};
use crate::spot::SpotConfig;
use crate::upgrade::UpgradeConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// HTTP API listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub autoscaling: ScalingConfig,

    #[serde(default)]
    pub upgrade: UpgradeConfig,

    #[serde(default)]
    pub spot: SpotConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Format from the file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

// ============================================================================
// SBIO: Pure parsing and validation (no I/O)
// ============================================================================

/// Parse a configuration document. Does not validate.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<ControlPlaneConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(ControlPlaneConfig::default());
    }
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

fn check_percent(name: &str, value: u32) -> Result<(), ConfigError> {
    if value > 100 {
        return Err(ConfigError::Invalid(format!(
            "{} must be between 0 and 100, got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_utilization(name: &str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !(0.0..=100.0).contains(&v) => Err(ConfigError::Invalid(format!(
            "{} must be between 0 and 100, got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}

fn check_unique_zones(section: &str, zones: &[String]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for zone in zones {
        if !seen.insert(zone.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "{}: zone '{}' listed more than once",
                section, zone
            )));
        }
    }
    Ok(())
}

impl ControlPlaneConfig {
    /// Reject configurations the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scaling = &self.autoscaling;
        if scaling.min_nodes > scaling.max_nodes {
            return Err(ConfigError::Invalid(format!(
                "autoscaling.minNodes ({}) exceeds autoscaling.maxNodes ({})",
                scaling.min_nodes, scaling.max_nodes
            )));
        }
        check_utilization(
            "autoscaling.targetCpuUtilization",
            scaling.target_cpu_utilization,
        )?;
        check_utilization(
            "autoscaling.targetMemoryUtilization",
            scaling.target_memory_utilization,
        )?;
        if scaling.evaluation_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "autoscaling.evaluationIntervalSeconds must be positive".to_string(),
            ));
        }

        let upgrade = &self.upgrade;
        check_percent("upgrade.canaryPercent", upgrade.canary_percent)?;
        if upgrade.health_check_interval_seconds == 0 || upgrade.health_check_timeout_seconds == 0
        {
            return Err(ConfigError::Invalid(
                "upgrade health check interval and timeout must be positive".to_string(),
            ));
        }
        if upgrade.max_unavailable == 0 {
            return Err(ConfigError::Invalid(
                "upgrade.maxUnavailable must be at least 1".to_string(),
            ));
        }

        check_percent("spot.spotPercentage", self.spot.spot_percentage)?;
        if self.spot.enabled
            && (self.spot.provider.trim().is_empty() || self.spot.instance_type.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "spot.provider and spot.instanceType are required when spot is enabled"
                    .to_string(),
            ));
        }
        check_unique_zones("spot.candidateZones", &self.spot.candidate_zones)?;

        check_unique_zones("placement.zones", &self.placement.zones)?;
        let distributor = ZoneDistributor::from_config(&self.placement);
        if !distributor
            .strategy_names()
            .contains(&self.placement.strategy)
        {
            return Err(ConfigError::Invalid(format!(
                "unknown placement strategy '{}'",
                self.placement.strategy
            )));
        }

        for hook in &self.hooks.registrations {
            resolve_executor_kind(&hook.action).map_err(|e| {
                ConfigError::Invalid(format!("hook {} ({}): {}", hook.id, hook.event, e))
            })?;
        }

        Ok(())
    }
}

/// `~/.fleetplane/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".fleetplane").join("config.yaml"))
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Read, parse and validate a configuration file
pub fn load_config_file(path: &Path) -> Result<ControlPlaneConfig, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content, format)?;
    config.validate()?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Explicit path, else the default location if it exists, else defaults
pub fn load_or_default(path: Option<&Path>) -> Result<ControlPlaneConfig, ConfigError> {
    if let Some(path) = path {
        return load_config_file(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => load_config_file(&path),
        _ => {
            debug!("No config file found, using defaults");
            Ok(ControlPlaneConfig::default())
        }
    }
}
