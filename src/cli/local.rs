//! Log-only collaborators for running the control plane without a cloud
//!
//! `serve` uses these until a real provider is wired in: the provisioner
//! keeps an in-memory node inventory, spot requests always succeed at a
//! fixed per-zone price, and node operations only log.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::autoscaling::{CloudProvisioner, ProvisionError};
use crate::placement::ZoneDistributionPlan;
use crate::registry::Named;
use crate::spot::{SpotError, SpotOutcome, SpotProvider, SpotRequest};
use crate::upgrade::{CollaboratorError, HealthChecker, NodeDrainer, NodeUpgrader};

/// In-memory node inventory
pub struct LocalProvisioner {
    inventory: Mutex<Inventory>,
}

struct Inventory {
    nodes: Vec<String>,
    next_id: u32,
}

impl LocalProvisioner {
    /// Start with `initial` nodes in `zone`
    pub fn new(initial: u32, zone: &str) -> Self {
        let nodes = (1..=initial).map(|i| format!("{}-node-{}", zone, i)).collect();
        Self {
            inventory: Mutex::new(Inventory {
                nodes,
                next_id: initial + 1,
            }),
        }
    }

    pub fn nodes(&self) -> Vec<String> {
        self.lock().nodes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CloudProvisioner for LocalProvisioner {
    async fn current_node_count(&self) -> Result<u32, ProvisionError> {
        Ok(self.lock().nodes.len() as u32)
    }

    async fn provision_nodes(
        &self,
        placement: &ZoneDistributionPlan,
    ) -> Result<Vec<String>, ProvisionError> {
        let mut inventory = self.lock();
        let mut created = Vec::new();
        for (zone, count) in placement.occupied_zones() {
            for _ in 0..count {
                let name = format!("{}-node-{}", zone, inventory.next_id);
                inventory.next_id += 1;
                info!("[local] Provisioned {}", name);
                inventory.nodes.push(name.clone());
                created.push(name);
            }
        }
        Ok(created)
    }

    async fn decommission_nodes(&self, count: u32) -> Result<Vec<String>, ProvisionError> {
        let mut inventory = self.lock();
        let keep = inventory.nodes.len().saturating_sub(count as usize);
        let removed = inventory.nodes.split_off(keep);
        for name in &removed {
            info!("[local] Decommissioned {}", name);
        }
        Ok(removed)
    }
}

/// Spot provider registered as "local"
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSpotProvider;

impl LocalSpotProvider {
    /// Stable price derived from the zone name
    fn price_for(zone: &str) -> f64 {
        let spread = zone.bytes().map(u32::from).sum::<u32>() % 5;
        0.02 + f64::from(spread) * 0.01
    }
}

impl Named for LocalSpotProvider {
    fn name(&self) -> &str {
        "local"
    }
}

#[async_trait]
impl SpotProvider for LocalSpotProvider {
    async fn create_spot_instance(&self, request: &SpotRequest) -> Result<SpotOutcome, SpotError> {
        let instance_ref = format!("local-{}", request.node_spec.name);
        info!(
            "[local] Created spot instance {} in {}",
            instance_ref, request.zone
        );
        Ok(SpotOutcome {
            instance_ref,
            zone: request.zone.clone(),
            actual_price: Self::price_for(&request.zone),
        })
    }

    async fn spot_price(&self, _instance_type: &str, zone: &str) -> Result<f64, SpotError> {
        Ok(Self::price_for(zone))
    }

    async fn is_spot_available(&self, _instance_type: &str, _zone: &str) -> Result<bool, SpotError> {
        Ok(true)
    }

    async fn terminate_instance(&self, node_id: &str) -> Result<(), SpotError> {
        info!("[local] Terminated spot instance {}", node_id);
        Ok(())
    }
}

/// Node operations that succeed immediately and log what they would do
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNodeOps;

#[async_trait]
impl NodeDrainer for LoggingNodeOps {
    async fn cordon(&self, node: &str) -> Result<(), CollaboratorError> {
        info!("[local] cordon {}", node);
        Ok(())
    }

    async fn drain(&self, node: &str, timeout: Duration) -> Result<(), CollaboratorError> {
        info!("[local] drain {} (timeout {}s)", node, timeout.as_secs());
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), CollaboratorError> {
        info!("[local] uncordon {}", node);
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for LoggingNodeOps {
    async fn is_node_healthy(&self, _node: &str) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}

#[async_trait]
impl NodeUpgrader for LoggingNodeOps {
    async fn upgrade_node(&self, node: &str, version: &str) -> Result<(), CollaboratorError> {
        info!("[local] upgrade {} to {}", node, version);
        Ok(())
    }
}
