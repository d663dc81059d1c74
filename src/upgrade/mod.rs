//! Cluster version upgrades
//!
//! An [`UpgradePlan`] splits the node list into waves. The
//! [`UpgradeOrchestrator`] walks the waves in order, driving each node
//! through the active [`UpgradeStrategy`]'s prepare, upgrade and validate
//! steps followed by a health check. Operators can pause, resume or stop a
//! running upgrade between waves; node failures are handled by the
//! configured [`FailurePolicy`].

pub mod orchestrator;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{Named, RegistryError};

pub use orchestrator::{ControlSignal, UpgradeOrchestrator};
pub use strategies::{
    BlueGreenStrategy, CanaryStrategy, RollingStrategy, SurgeStrategy, BLUE_GREEN, CANARY,
    ROLLING, SURGE,
};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a node collaborator (drainer, upgrader, ...)
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpgradeError {
    #[error("An upgrade is already in progress")]
    AlreadyInProgress,

    #[error("No upgrade is running")]
    NotRunning,

    #[error("Upgrade plan has no nodes")]
    NoNodes,

    #[error("Node {0} appears more than once")]
    DuplicateNode(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Node {node} failed during {step}: {cause}")]
    NodeFailed {
        node: String,
        step: String,
        cause: String,
    },

    #[error("Node {node} not healthy after {seconds}s")]
    HealthCheckTimeout { node: String, seconds: u64 },

    #[error("Upgrade cancelled at {0}")]
    Cancelled(String),

    #[error("Upgrade stopped by operator")]
    Stopped,

    #[error("Rollback failed: {rollback} (original failure: {original})")]
    RollbackFailed { original: String, rollback: String },

    #[error("Strategy requires a node provisioner")]
    ProvisionerRequired,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl UpgradeError {
    pub fn node_failed(node: &str, step: &str, cause: impl std::fmt::Display) -> Self {
        Self::NodeFailed {
            node: node.to_string(),
            step: step.to_string(),
            cause: cause.to_string(),
        }
    }
}

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    Idle,
    Planned,
    Executing,
    Paused,
    PausedOnFailure,
    RollingBack,
    Completed,
    RolledBack,
    Stopped,
    Failed,
}

impl UpgradePhase {
    /// An execution owns the orchestrator in these phases
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Executing | Self::Paused | Self::PausedOnFailure | Self::RollingBack
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::RolledBack | Self::Stopped | Self::Failed
        )
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::PausedOnFailure => "paused_on_failure",
            Self::RollingBack => "rolling_back",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeUpgradeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    pub node: String,
    pub wave: u32,
    pub status: NodeUpgradeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlan {
    pub id: Uuid,
    pub current_version: String,
    pub target_version: String,
    pub strategy_name: String,
    pub nodes: Vec<NodePlan>,
    pub total_waves: u32,
    pub estimated_duration_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl UpgradePlan {
    /// Node names grouped by wave, waves ascending
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut waves = vec![Vec::new(); self.total_waves as usize];
        for node in &self.nodes {
            if let Some(wave) = waves.get_mut(node.wave as usize) {
                wave.push(node.node.clone());
            }
        }
        waves
    }

    /// Reject plans whose nodes and wave numbering disagree
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.nodes.is_empty() {
            return Err(UpgradeError::NoNodes);
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|n| n.node == node.node) {
                return Err(UpgradeError::DuplicateNode(node.node.clone()));
            }
            if node.wave >= self.total_waves {
                return Err(UpgradeError::InvalidPlan(format!(
                    "node {} is in wave {} of a {}-wave plan",
                    node.node, node.wave, self.total_waves
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodePlan> {
        self.nodes.iter().find(|n| n.node == name)
    }

    pub fn set_node_status(&mut self, name: &str, status: NodeUpgradeStatus) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.node == name) {
            node.status = status;
        }
    }

    pub fn nodes_with_status(&self, status: NodeUpgradeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.node.clone())
            .collect()
    }
}

/// Live view of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    pub plan_id: Option<Uuid>,
    pub phase: UpgradePhase,
    pub progress_percent: u32,
    pub current_node: Option<String>,
    pub current_wave: Option<u32>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl UpgradeStatus {
    pub fn idle() -> Self {
        Self {
            plan_id: None,
            phase: UpgradePhase::Idle,
            progress_percent: 0,
            current_node: None,
            current_wave: None,
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn planned(plan_id: Uuid) -> Self {
        Self {
            plan_id: Some(plan_id),
            phase: UpgradePhase::Planned,
            ..Self::idle()
        }
    }
}

impl Default for UpgradeStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop and wait for an operator; Resume retries the failed node
    PauseOnFailure,
    /// Roll completed nodes back to the current version
    AutoRollback,
    /// Fail the upgrade immediately
    Propagate,
}

/// Upgrade configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeConfig {
    /// rolling, canary, blue-green, surge
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,

    /// Canary wave size as a percentage of the node count
    #[serde(default = "default_canary_percent")]
    pub canary_percent: u32,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,

    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_seconds: u64,

    /// Used for the plan's duration estimate
    #[serde(default = "default_node_estimate")]
    pub node_estimate_seconds: u64,

    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_unavailable: default_max_unavailable(),
            canary_percent: default_canary_percent(),
            drain_timeout_seconds: default_drain_timeout(),
            health_check_interval_seconds: default_health_interval(),
            health_check_timeout_seconds: default_health_timeout(),
            node_estimate_seconds: default_node_estimate(),
            failure_policy: default_failure_policy(),
        }
    }
}

impl UpgradeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }
}

fn default_strategy() -> String {
    ROLLING.to_string()
}

fn default_max_unavailable() -> u32 {
    1
}

fn default_canary_percent() -> u32 {
    10
}

fn default_drain_timeout() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    300
}

fn default_node_estimate() -> u64 {
    600
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::PauseOnFailure
}

// ============================================================================
// Collaborator contracts
// ============================================================================

#[async_trait]
pub trait NodeDrainer: Send + Sync {
    async fn cordon(&self, node: &str) -> Result<(), CollaboratorError>;

    async fn drain(&self, node: &str, timeout: Duration) -> Result<(), CollaboratorError>;

    async fn uncordon(&self, node: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn is_node_healthy(&self, node: &str) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait NodeUpgrader: Send + Sync {
    async fn upgrade_node(&self, node: &str, version: &str) -> Result<(), CollaboratorError>;
}

/// Creates replacement capacity for blue-green and surge upgrades
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// New node running `version`. Returns its name.
    async fn provision_replacement(
        &self,
        node: &str,
        version: &str,
    ) -> Result<String, CollaboratorError>;

    async fn cutover_traffic(&self, from: &str, to: &str) -> Result<(), CollaboratorError>;

    async fn decommission(&self, node: &str) -> Result<(), CollaboratorError>;
}

/// Collaborators shared by every strategy step
pub struct UpgradeContext {
    pub drainer: Arc<dyn NodeDrainer>,
    pub health: Arc<dyn HealthChecker>,
    pub upgrader: Arc<dyn NodeUpgrader>,
    pub provisioner: Option<Arc<dyn NodeProvisioner>>,
    pub drain_timeout: Duration,
    /// original node -> replacement or surge node created during prepare
    replacements: DashMap<String, String>,
}

impl UpgradeContext {
    pub fn new(
        drainer: Arc<dyn NodeDrainer>,
        health: Arc<dyn HealthChecker>,
        upgrader: Arc<dyn NodeUpgrader>,
    ) -> Self {
        Self {
            drainer,
            health,
            upgrader,
            provisioner: None,
            drain_timeout: Duration::from_secs(default_drain_timeout()),
            replacements: DashMap::new(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn provisioner(&self) -> Result<&Arc<dyn NodeProvisioner>, UpgradeError> {
        self.provisioner
            .as_ref()
            .ok_or(UpgradeError::ProvisionerRequired)
    }

    pub async fn cordon_and_drain(&self, node: &str) -> Result<(), UpgradeError> {
        self.drainer
            .cordon(node)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "cordon", e))?;
        self.drainer
            .drain(node, self.drain_timeout)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "drain", e))
    }

    pub async fn uncordon(&self, node: &str) -> Result<(), UpgradeError> {
        self.drainer
            .uncordon(node)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "uncordon", e))
    }

    pub async fn upgrade_in_place(&self, node: &str, version: &str) -> Result<(), UpgradeError> {
        self.upgrader
            .upgrade_node(node, version)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "upgrade", e))
    }

    pub fn record_replacement(&self, node: &str, replacement: String) {
        self.replacements.insert(node.to_string(), replacement);
    }

    pub fn replacement(&self, node: &str) -> Option<String> {
        self.replacements.get(node).map(|r| r.value().clone())
    }

    pub fn take_replacement(&self, node: &str) -> Option<String> {
        self.replacements.remove(node).map(|(_, r)| r)
    }
}

/// An upgrade policy: wave sizing plus the per-node steps
#[async_trait]
pub trait UpgradeStrategy: Named + Send + Sync {
    /// Nodes per wave
    fn batch_size(&self, total_nodes: usize, max_unavailable: usize) -> usize;

    async fn prepare_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError>;

    async fn upgrade_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError>;

    /// Finish the node. Returns the node that must pass the health check.
    async fn validate_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<String, UpgradeError>;
}
