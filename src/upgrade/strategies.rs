//! Built-in upgrade strategies

use async_trait::async_trait;
use tracing::debug;

use super::{UpgradeContext, UpgradeError, UpgradeStrategy};
use crate::registry::Named;

pub const ROLLING: &str = "rolling";
pub const CANARY: &str = "canary";
pub const BLUE_GREEN: &str = "blue-green";
pub const SURGE: &str = "surge";

/// Drain, upgrade in place, uncordon
async fn in_place_prepare(ctx: &UpgradeContext, node: &str) -> Result<(), UpgradeError> {
    ctx.cordon_and_drain(node).await
}

async fn in_place_validate(ctx: &UpgradeContext, node: &str) -> Result<String, UpgradeError> {
    ctx.uncordon(node).await?;
    Ok(node.to_string())
}

// ============================================================================
// Rolling
// ============================================================================

/// In-place upgrade, a quarter of the fleet per wave at most
#[derive(Debug, Clone, Default)]
pub struct RollingStrategy;

impl Named for RollingStrategy {
    fn name(&self) -> &str {
        ROLLING
    }
}

#[async_trait]
impl UpgradeStrategy for RollingStrategy {
    fn batch_size(&self, total_nodes: usize, max_unavailable: usize) -> usize {
        let quarter = total_nodes.div_ceil(4);
        max_unavailable.min(quarter).max(1)
    }

    async fn prepare_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<(), UpgradeError> {
        in_place_prepare(ctx, node).await
    }

    async fn upgrade_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError> {
        ctx.upgrade_in_place(node, version).await
    }

    async fn validate_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<String, UpgradeError> {
        in_place_validate(ctx, node).await
    }
}

// ============================================================================
// Canary
// ============================================================================

/// In-place upgrade in waves of `percent`% of the fleet
#[derive(Debug, Clone)]
pub struct CanaryStrategy {
    percent: u32,
}

impl CanaryStrategy {
    pub fn new(percent: u32) -> Self {
        Self {
            percent: percent.min(100),
        }
    }
}

impl Default for CanaryStrategy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Named for CanaryStrategy {
    fn name(&self) -> &str {
        CANARY
    }
}

#[async_trait]
impl UpgradeStrategy for CanaryStrategy {
    fn batch_size(&self, total_nodes: usize, _max_unavailable: usize) -> usize {
        (total_nodes * self.percent as usize / 100).max(1)
    }

    async fn prepare_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<(), UpgradeError> {
        in_place_prepare(ctx, node).await
    }

    async fn upgrade_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError> {
        ctx.upgrade_in_place(node, version).await
    }

    async fn validate_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<String, UpgradeError> {
        in_place_validate(ctx, node).await
    }
}

// ============================================================================
// Blue-green
// ============================================================================

/// Replace each node with a fresh one at the target version
#[derive(Debug, Clone, Default)]
pub struct BlueGreenStrategy;

impl Named for BlueGreenStrategy {
    fn name(&self) -> &str {
        BLUE_GREEN
    }
}

#[async_trait]
impl UpgradeStrategy for BlueGreenStrategy {
    fn batch_size(&self, _total_nodes: usize, _max_unavailable: usize) -> usize {
        1
    }

    async fn prepare_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError> {
        let replacement = ctx
            .provisioner()?
            .provision_replacement(node, version)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "provision replacement", e))?;
        debug!("Provisioned {} to replace {}", replacement, node);
        ctx.record_replacement(node, replacement);
        Ok(())
    }

    async fn upgrade_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<(), UpgradeError> {
        let replacement = ctx
            .replacement(node)
            .ok_or_else(|| UpgradeError::node_failed(node, "cutover", "no replacement node"))?;
        ctx.cordon_and_drain(node).await?;
        ctx.provisioner()?
            .cutover_traffic(node, &replacement)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "cutover", e))
    }

    async fn validate_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<String, UpgradeError> {
        let replacement = ctx
            .take_replacement(node)
            .ok_or_else(|| UpgradeError::node_failed(node, "validate", "no replacement node"))?;
        ctx.provisioner()?
            .decommission(node)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "decommission", e))?;
        Ok(replacement)
    }
}

// ============================================================================
// Surge
// ============================================================================

/// Add a temporary surge node, upgrade the original in place, remove the surge
#[derive(Debug, Clone, Default)]
pub struct SurgeStrategy;

impl Named for SurgeStrategy {
    fn name(&self) -> &str {
        SURGE
    }
}

#[async_trait]
impl UpgradeStrategy for SurgeStrategy {
    fn batch_size(&self, _total_nodes: usize, _max_unavailable: usize) -> usize {
        1
    }

    async fn prepare_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError> {
        let surge = ctx
            .provisioner()?
            .provision_replacement(node, version)
            .await
            .map_err(|e| UpgradeError::node_failed(node, "provision surge node", e))?;
        debug!("Surge node {} added for {}", surge, node);
        ctx.record_replacement(node, surge);
        Ok(())
    }

    async fn upgrade_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        version: &str,
    ) -> Result<(), UpgradeError> {
        ctx.cordon_and_drain(node).await?;
        ctx.upgrade_in_place(node, version).await
    }

    async fn validate_node(
        &self,
        ctx: &UpgradeContext,
        node: &str,
        _version: &str,
    ) -> Result<String, UpgradeError> {
        ctx.uncordon(node).await?;
        if let Some(surge) = ctx.take_replacement(node) {
            ctx.provisioner()?
                .decommission(&surge)
                .await
                .map_err(|e| UpgradeError::node_failed(&surge, "decommission", e))?;
        }
        Ok(node.to_string())
    }
}
