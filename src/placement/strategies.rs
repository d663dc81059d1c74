//! Built-in zone placement policies

use std::collections::{BTreeMap, HashMap};

use super::{validate_zones, DistributionStrategy, PlacementError, ZoneDistributionPlan};
use crate::registry::Named;

pub const ROUND_ROBIN: &str = "round_robin";
pub const WEIGHTED: &str = "weighted";
pub const PACKED: &str = "packed";
pub const SPREAD: &str = "spread";

/// Even split with the remainder going to the first zones in caller order
pub fn round_robin_counts(total_units: u32, zones: &[String]) -> BTreeMap<String, u32> {
    let zone_count = zones.len() as u32;
    let mut counts = BTreeMap::new();
    if zone_count == 0 {
        return counts;
    }

    let base = total_units / zone_count;
    let remainder = total_units % zone_count;

    for (i, zone) in zones.iter().enumerate() {
        let extra = if (i as u32) < remainder { 1 } else { 0 };
        counts.insert(zone.clone(), base + extra);
    }
    counts
}

/// Evenly spread units; the first `total mod zones` zones get one extra
#[derive(Debug, Clone, Default)]
pub struct RoundRobinStrategy;

impl Named for RoundRobinStrategy {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }
}

impl DistributionStrategy for RoundRobinStrategy {
    fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        validate_zones(zones)?;
        Ok(ZoneDistributionPlan::new(
            total_units,
            round_robin_counts(total_units, zones),
            self.name(),
        ))
    }
}

/// Units proportional to per-zone integer weights
///
/// Zones without a weight get weight zero. When no zone carries a positive
/// weight the split falls back to round-robin.
#[derive(Debug, Clone, Default)]
pub struct WeightedStrategy {
    weights: HashMap<String, u32>,
}

impl WeightedStrategy {
    pub fn new(weights: HashMap<String, u32>) -> Self {
        Self { weights }
    }

    fn weight(&self, zone: &str) -> u32 {
        self.weights.get(zone).copied().unwrap_or(0)
    }
}

impl Named for WeightedStrategy {
    fn name(&self) -> &str {
        WEIGHTED
    }
}

impl DistributionStrategy for WeightedStrategy {
    fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        validate_zones(zones)?;

        let total_weight: u64 = zones.iter().map(|z| self.weight(z) as u64).sum();
        if total_weight == 0 {
            return Ok(ZoneDistributionPlan::new(
                total_units,
                round_robin_counts(total_units, zones),
                self.name(),
            ));
        }

        let mut counts = BTreeMap::new();
        let mut assigned = 0u32;
        for zone in zones {
            let share = (total_units as u64 * self.weight(zone) as u64 / total_weight) as u32;
            assigned += share;
            counts.insert(zone.clone(), share);
        }

        // Highest weight first; sort is stable so equal weights keep input order
        let mut by_weight: Vec<&String> = zones.iter().filter(|z| self.weight(z) > 0).collect();
        by_weight.sort_by(|a, b| self.weight(b).cmp(&self.weight(a)));

        let mut remainder = total_units - assigned;
        for zone in by_weight.iter().cycle() {
            if remainder == 0 {
                break;
            }
            if let Some(count) = counts.get_mut(*zone) {
                *count += 1;
            }
            remainder -= 1;
        }

        Ok(ZoneDistributionPlan::new(total_units, counts, self.name()))
    }
}

/// Bin-packing: fill each zone to capacity in input order
///
/// Units beyond the combined capacity are spread round-robin on top.
#[derive(Debug, Clone)]
pub struct PackedStrategy {
    zone_capacity: u32,
}

impl PackedStrategy {
    /// A capacity of zero means zones are unbounded
    pub fn new(zone_capacity: u32) -> Self {
        Self { zone_capacity }
    }
}

impl Default for PackedStrategy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Named for PackedStrategy {
    fn name(&self) -> &str {
        PACKED
    }
}

impl DistributionStrategy for PackedStrategy {
    fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        validate_zones(zones)?;

        let mut counts: BTreeMap<String, u32> = zones.iter().map(|z| (z.clone(), 0)).collect();

        if self.zone_capacity == 0 {
            counts.insert(zones[0].clone(), total_units);
            return Ok(ZoneDistributionPlan::new(total_units, counts, self.name()));
        }

        let mut remaining = total_units;
        for zone in zones {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(self.zone_capacity);
            counts.insert(zone.clone(), take);
            remaining -= take;
        }

        if remaining > 0 {
            for (zone, extra) in round_robin_counts(remaining, zones) {
                if let Some(count) = counts.get_mut(&zone) {
                    *count += extra;
                }
            }
        }

        Ok(ZoneDistributionPlan::new(total_units, counts, self.name()))
    }
}

/// High-availability spread: maximise the minimum per-zone count
#[derive(Debug, Clone, Default)]
pub struct SpreadStrategy;

impl Named for SpreadStrategy {
    fn name(&self) -> &str {
        SPREAD
    }
}

impl DistributionStrategy for SpreadStrategy {
    fn distribute(
        &self,
        total_units: u32,
        zones: &[String],
    ) -> Result<ZoneDistributionPlan, PlacementError> {
        validate_zones(zones)?;
        Ok(ZoneDistributionPlan::new(
            total_units,
            round_robin_counts(total_units, zones),
            self.name(),
        ))
    }
}
