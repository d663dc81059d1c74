//! Zone placement
//!
//! Decides how many units (nodes, spot instances, replicas) each availability
//! zone receives, and how to move units to even out a skewed placement.
//!
//! Every [`ZoneDistributionPlan`] produced here satisfies two invariants:
//! the per-zone counts sum to exactly the requested total, and the keys are
//! exactly the input zone set (zones that receive nothing are present with 0).

pub mod strategies;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::registry::{Named, RegistryError, StrategyRegistry};

pub use strategies::{
    round_robin_counts, PackedStrategy, RoundRobinStrategy, SpreadStrategy, WeightedStrategy,
    PACKED, ROUND_ROBIN, SPREAD, WEIGHTED,
};

/// Errors from placement calculations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error("At least one zone is required")]
    NoZones,

    #[error("Zone '{0}' listed more than once")]
    DuplicateZone(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How a number of units is spread across zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDistributionPlan {
    pub total_units: u32,
    pub zone_counts: BTreeMap<String, u32>,
    pub strategy_name: String,
}

impl ZoneDistributionPlan {
    pub fn new(
        total_units: u32,
        zone_counts: BTreeMap<String, u32>,
        strategy_name: impl Into<String>,
    ) -> Self {
        Self {
            total_units,
            zone_counts,
            strategy_name: strategy_name.into(),
        }
    }

    /// Units assigned to a zone (0 for unknown zones)
    pub fn count(&self, zone: &str) -> u32 {
        self.zone_counts.get(zone).copied().unwrap_or(0)
    }

    /// Whether the counts add up to the total
    pub fn is_consistent(&self) -> bool {
        self.zone_counts.values().map(|c| *c as u64).sum::<u64>() == self.total_units as u64
    }

    /// Zones with at least one unit, in key order
    pub fn occupied_zones(&self) -> impl Iterator<Item = (&String, u32)> {
        self.zone_counts
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(z, c)| (z, *c))
    }
}

/// A transfer of units between two zones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMove {
    pub from: String,
    pub to: String,
    pub count: u32,
}

/// A placement policy
pub trait DistributionStrategy: Named + Send + Sync {
    fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError>;
}

/// Reject empty or duplicated zone lists
pub fn validate_zones(zones: &[String]) -> Result<(), PlacementError> {
    if zones.is_empty() {
        return Err(PlacementError::NoZones);
    }
    let mut seen = HashSet::new();
    for zone in zones {
        if !seen.insert(zone.as_str()) {
            return Err(PlacementError::DuplicateZone(zone.clone()));
        }
    }
    Ok(())
}

/// Placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementConfig {
    /// Default placement policy
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Zones new capacity may be placed in, in preference order
    #[serde(default)]
    pub zones: Vec<String>,

    /// Per-zone weights for the weighted policy
    #[serde(default)]
    pub weights: HashMap<String, u32>,

    /// Per-zone capacity for the packed policy (0 = unbounded)
    #[serde(default = "default_zone_capacity")]
    pub zone_capacity: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            zones: Vec::new(),
            weights: HashMap::new(),
            zone_capacity: default_zone_capacity(),
        }
    }
}

fn default_strategy() -> String {
    ROUND_ROBIN.to_string()
}

fn default_zone_capacity() -> u32 {
    10
}

/// Computes zone distributions with a registry of placement policies
pub struct ZoneDistributor {
    strategies: StrategyRegistry<dyn DistributionStrategy>,
    default_strategy: String,
}

impl ZoneDistributor {
    /// Distributor with the four built-in policies and round-robin as default
    pub fn new() -> Self {
        Self::from_config(&PlacementConfig::default())
    }

    /// Distributor whose weighted/packed policies and default come from config
    pub fn from_config(config: &PlacementConfig) -> Self {
        let strategies: StrategyRegistry<dyn DistributionStrategy> = StrategyRegistry::new();
        strategies.register(Arc::new(RoundRobinStrategy));
        strategies.register(Arc::new(WeightedStrategy::new(config.weights.clone())));
        strategies.register(Arc::new(PackedStrategy::new(config.zone_capacity)));
        strategies.register(Arc::new(SpreadStrategy));

        Self {
            strategies,
            default_strategy: config.strategy.clone(),
        }
    }

    /// Add or replace a placement policy
    pub fn register(&self, strategy: Arc<dyn DistributionStrategy>) {
        self.strategies.register(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.list()
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    /// Distribute with the default policy
    pub fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        self.distribute_with(&self.default_strategy, total_units, zones)
    }

    /// Distribute with a named policy
    pub fn distribute_with(
        &self,
        strategy: &str,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        let strategy = self.strategies.get(strategy)?;
        let plan = strategy.distribute(total_units, zones)?;
        debug!(
            "Distributed {} unit(s) over {} zone(s) with '{}'",
            total_units,
            zones.len(),
            plan.strategy_name
        );
        Ok(plan)
    }

    /// Per-zone change that brings `current` to an even round-robin spread
    pub fn rebalance(&self, current: &BTreeMap<String, u32>) -> BTreeMap<String, i64> {
        rebalance(current)
    }
}

impl Default for ZoneDistributor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-zone `target - current`, where target is the round-robin spread of the
/// same total over the same zones (in key order). Always sums to zero.
pub fn rebalance(current: &BTreeMap<String, u32>) -> BTreeMap<String, i64> {
    // The total of many u32 counts needs the wider type
    let total: u64 = current.values().map(|&have| u64::from(have)).sum();
    let zone_count = current.len().max(1) as u64;
    let base = total / zone_count;
    let remainder = total % zone_count;

    current
        .iter()
        .enumerate()
        .map(|(i, (zone, have))| {
            let want = base + u64::from((i as u64) < remainder);
            (zone.clone(), want as i64 - i64::from(*have))
        })
        .collect()
}

/// Turn a zero-sum delta map into concrete moves from surplus to deficit zones
pub fn plan_moves(deltas: &BTreeMap<String, i64>) -> Vec<ZoneMove> {
    let mut surplus: Vec<(String, u32)> = deltas
        .iter()
        .filter(|(_, d)| **d < 0)
        .map(|(z, d)| (z.clone(), d.unsigned_abs() as u32))
        .collect();
    let mut deficit: Vec<(String, u32)> = deltas
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(z, d)| (z.clone(), *d as u32))
        .collect();

    let mut moves = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < surplus.len() && j < deficit.len() {
        let count = surplus[i].1.min(deficit[j].1);
        moves.push(ZoneMove {
            from: surplus[i].0.clone(),
            to: deficit[j].0.clone(),
            count,
        });
        surplus[i].1 -= count;
        deficit[j].1 -= count;
        if surplus[i].1 == 0 {
            i += 1;
        }
        if deficit[j].1 == 0 {
            j += 1;
        }
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sum_invariant_all_strategies() {
        let distributor = ZoneDistributor::new();
        let zone_sets = [
            zones(&["z1"]),
            zones(&["z1", "z2"]),
            zones(&["z1", "z2", "z3"]),
            zones(&["a", "b", "c", "d", "e"]),
        ];

        for name in [ROUND_ROBIN, WEIGHTED, PACKED, SPREAD] {
            for zone_set in &zone_sets {
                for units in [0u32, 1, 2, 7, 10, 31, 100] {
                    let plan = distributor.distribute_with(name, units, zone_set).unwrap();
                    assert!(plan.is_consistent(), "{} {} {:?}", name, units, zone_set);
                    assert_eq!(plan.total_units, units);
                    assert_eq!(plan.zone_counts.len(), zone_set.len());
                    for zone in zone_set {
                        assert!(plan.zone_counts.contains_key(zone));
                    }
                }
            }
        }
    }

    #[test]
    fn test_default_strategy_is_round_robin() {
        let distributor = ZoneDistributor::new();
        let plan = distributor.distribute(10, &zones(&["z1", "z2", "z3"])).unwrap();
        assert_eq!(plan.strategy_name, ROUND_ROBIN);
        assert_eq!(plan.count("z1"), 4);
    }

    #[test]
    fn test_unknown_strategy() {
        let distributor = ZoneDistributor::new();
        let err = distributor
            .distribute_with("random", 3, &zones(&["z1"]))
            .unwrap_err();
        assert_eq!(
            err,
            PlacementError::Registry(RegistryError::NotFound("random".to_string()))
        );
    }

    #[test]
    fn test_empty_and_duplicate_zones() {
        let distributor = ZoneDistributor::new();
        assert_eq!(
            distributor.distribute(3, &[]).unwrap_err(),
            PlacementError::NoZones
        );
        assert_eq!(
            distributor.distribute(3, &zones(&["a", "a"])).unwrap_err(),
            PlacementError::DuplicateZone("a".to_string())
        );
    }

    #[test]
    fn test_from_config_uses_weights_and_default() {
        let config = PlacementConfig {
            strategy: WEIGHTED.to_string(),
            zones: zones(&["a", "b"]),
            weights: HashMap::from([("a".to_string(), 1), ("b".to_string(), 3)]),
            zone_capacity: 10,
        };
        let distributor = ZoneDistributor::from_config(&config);
        let plan = distributor.distribute(4, &config.zones).unwrap();
        assert_eq!(plan.count("a"), 1);
        assert_eq!(plan.count("b"), 3);
    }

    #[test]
    fn test_rebalance_zero_sum() {
        let skewed = [
            BTreeMap::from([("a".to_string(), 10), ("b".to_string(), 0), ("c".to_string(), 0)]),
            BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 7)]),
            BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 0)]),
            BTreeMap::from([
                ("a".to_string(), 3),
                ("b".to_string(), 3),
                ("c".to_string(), 3),
                ("d".to_string(), 50),
            ]),
        ];

        for current in &skewed {
            let delta = rebalance(current);
            assert_eq!(delta.values().sum::<i64>(), 0, "{:?}", current);
            assert_eq!(delta.len(), current.len());
        }
    }

    #[test]
    fn test_rebalance_values() {
        let current = BTreeMap::from([
            ("a".to_string(), 9),
            ("b".to_string(), 0),
            ("c".to_string(), 1),
        ]);
        let delta = rebalance(&current);
        assert_eq!(delta["a"], -5);
        assert_eq!(delta["b"], 3);
        assert_eq!(delta["c"], 2);
    }

    #[test]
    fn test_rebalance_counts_near_u32_max() {
        let current = BTreeMap::from([("a".to_string(), u32::MAX), ("b".to_string(), 1)]);
        let delta = rebalance(&current);
        let half = 1_i64 << 31;
        assert_eq!(delta["a"], -(half - 1));
        assert_eq!(delta["b"], half - 1);
        assert_eq!(delta.values().sum::<i64>(), 0);

        let moves = plan_moves(&delta);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].count, (half - 1) as u32);
    }

    #[test]
    fn test_rebalance_already_balanced() {
        let current = BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 2)]);
        let delta = rebalance(&current);
        assert!(delta.values().all(|d| *d == 0));
    }

    #[test]
    fn test_plan_moves() {
        let current = BTreeMap::from([
            ("a".to_string(), 9),
            ("b".to_string(), 0),
            ("c".to_string(), 1),
        ]);
        let moves = plan_moves(&rebalance(&current));
        assert_eq!(
            moves,
            vec![
                ZoneMove {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    count: 3
                },
                ZoneMove {
                    from: "a".to_string(),
                    to: "c".to_string(),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn test_occupied_zones() {
        let plan = ZoneDistributor::new()
            .distribute(1, &zones(&["z1", "z2"]))
            .unwrap();
        let occupied: Vec<_> = plan.occupied_zones().collect();
        assert_eq!(occupied, vec![(&"z1".to_string(), 1)]);
    }
}
