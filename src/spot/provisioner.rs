//! Mixed spot/on-demand node provisioning
//!
//! [`SpotAwareProvisioner`] sits in front of an on-demand
//! [`CloudProvisioner`]. Scale-ups put the configured share of new nodes on
//! spot capacity, and rejected spot requests fall back to on-demand in the
//! same zone when the rejection allows it. Scale-downs give up spot nodes
//! first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InterruptionHandler, NodeSpec, SpotConfig, SpotError, SpotManager, SpotStrategy};
use crate::autoscaling::{CloudProvisioner, ProvisionError};
use crate::placement::ZoneDistributionPlan;
use crate::registry::RegistryError;

// ============================================================================
// Inventory
// ============================================================================

/// Spot nodes currently owned by the provisioner
///
/// Registered as an interruption handler so interrupted nodes leave the
/// count before the provider terminates them.
#[derive(Debug, Clone, Default)]
pub struct SpotInventory {
    nodes: Arc<Mutex<Vec<String>>>,
}

impl SpotInventory {
    pub fn nodes(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, node: String) {
        self.lock().push(node);
    }

    fn pop(&self) -> Option<String> {
        self.lock().pop()
    }

    fn remove(&self, node: &str) -> bool {
        let mut nodes = self.lock();
        match nodes.iter().position(|n| n == node) {
            Some(i) => {
                nodes.remove(i);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InterruptionHandler for SpotInventory {
    async fn on_interruption(&self, provider: &str, node_id: &str) -> Result<(), SpotError> {
        if self.remove(node_id) {
            info!("Dropped interrupted spot node {} ({})", node_id, provider);
        } else {
            debug!("Interrupted node {} is not in the spot inventory", node_id);
        }
        Ok(())
    }
}

// ============================================================================
// Provisioner
// ============================================================================

pub struct SpotAwareProvisioner {
    on_demand: Arc<dyn CloudProvisioner>,
    manager: Arc<SpotManager>,
    config: SpotConfig,
    cancel: CancellationToken,
    inventory: SpotInventory,
    next_id: AtomicU32,
}

impl SpotAwareProvisioner {
    /// Wrap `on_demand`; fails when spot is enabled for an unregistered provider
    pub fn new(
        on_demand: Arc<dyn CloudProvisioner>,
        manager: Arc<SpotManager>,
        config: SpotConfig,
    ) -> Result<Self, SpotError> {
        if config.enabled && !manager.has_provider(&config.provider) {
            return Err(RegistryError::NotFound(config.provider.clone()).into());
        }

        let inventory = SpotInventory::default();
        manager.register_interruption_handler(Arc::new(inventory.clone()));

        Ok(Self {
            on_demand,
            manager,
            config,
            cancel: CancellationToken::new(),
            inventory,
            next_id: AtomicU32::new(1),
        })
    }

    /// Abandon in-flight provider calls when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn inventory(&self) -> SpotInventory {
        self.inventory.clone()
    }

    /// Try one spot node in `zone`. `Ok(None)` means fall back to on-demand.
    async fn try_spot(&self, zone: &str) -> Result<Option<String>, ProvisionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let spec = NodeSpec::new(format!("{}-spot-{}", zone, id), &self.config.instance_type)
            .in_zone(zone);

        match self
            .manager
            .create_spot_instance(&self.config.provider, &spec, &self.config, &self.cancel)
            .await
        {
            Ok(outcome) => Ok(Some(outcome.instance_ref)),
            Err(SpotError::Rejected(rejection)) if rejection.should_fallback() => {
                info!("Falling back to on-demand in {}: {}", zone, rejection);
                Ok(None)
            }
            Err(SpotError::Rejected(rejection)) => {
                Err(ProvisionError::InsufficientCapacity(rejection.to_string()))
            }
            Err(e) => Err(ProvisionError::Failed(e.to_string())),
        }
    }
}

/// Zones visited one unit at a time so spot capacity spreads across zones
fn interleave(placement: &ZoneDistributionPlan) -> Vec<String> {
    let zones: Vec<(&String, u32)> = placement.occupied_zones().collect();
    let rounds = zones.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let mut order = Vec::with_capacity(placement.total_units as usize);
    for round in 0..rounds {
        for (zone, count) in &zones {
            if round < *count {
                order.push((*zone).clone());
            }
        }
    }
    order
}

#[async_trait]
impl CloudProvisioner for SpotAwareProvisioner {
    async fn current_node_count(&self) -> Result<u32, ProvisionError> {
        let on_demand = self.on_demand.current_node_count().await?;
        Ok(on_demand.saturating_add(self.inventory.len() as u32))
    }

    async fn provision_nodes(
        &self,
        placement: &ZoneDistributionPlan,
    ) -> Result<Vec<String>, ProvisionError> {
        if !self.config.enabled {
            return self.on_demand.provision_nodes(placement).await;
        }

        let (spot_units, _) =
            SpotStrategy::split_capacity(placement.total_units, self.config.spot_percentage);
        let mut on_demand_counts: BTreeMap<String, u32> = placement
            .zone_counts
            .keys()
            .map(|zone| (zone.clone(), 0))
            .collect();
        let mut created = Vec::new();

        for (i, zone) in interleave(placement).into_iter().enumerate() {
            if (i as u32) < spot_units {
                if let Some(node) = self.try_spot(&zone).await? {
                    self.inventory.push(node.clone());
                    created.push(node);
                    continue;
                }
            }
            *on_demand_counts.entry(zone).or_insert(0) += 1;
        }

        let on_demand_total: u32 = on_demand_counts.values().sum();
        info!(
            "Provisioning {} spot and {} on-demand nodes",
            created.len(),
            on_demand_total
        );
        if on_demand_total > 0 {
            let plan = ZoneDistributionPlan::new(
                on_demand_total,
                on_demand_counts,
                placement.strategy_name.clone(),
            );
            created.extend(self.on_demand.provision_nodes(&plan).await?);
        }
        Ok(created)
    }

    async fn decommission_nodes(&self, count: u32) -> Result<Vec<String>, ProvisionError> {
        let mut removed = Vec::new();
        while (removed.len() as u32) < count {
            let next = self.inventory.pop();
            let Some(node) = next else { break };
            if let Err(e) = self
                .manager
                .terminate_instance(&self.config.provider, &node, &self.cancel)
                .await
            {
                warn!("Failed to terminate spot node {}: {}", node, e);
                self.inventory.push(node);
                return Err(ProvisionError::Failed(e.to_string()));
            }
            removed.push(node);
        }

        let rest = count - removed.len() as u32;
        if rest > 0 {
            removed.extend(self.on_demand.decommission_nodes(rest).await?);
        }
        Ok(removed)
    }
}
