//! Spot placement policy helpers

use std::collections::BTreeMap;

/// Pure pricing and capacity rules for spot requests
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotStrategy;

impl SpotStrategy {
    /// Cheapest zone; ties go to the first zone in key order
    ///
    /// Non-finite prices are ignored.
    pub fn select_best_zone(prices: &BTreeMap<String, f64>) -> Option<(String, f64)> {
        let mut best: Option<(&String, f64)> = None;
        for (zone, price) in prices {
            if !price.is_finite() {
                continue;
            }
            match best {
                Some((_, current)) if *price >= current => {}
                _ => best = Some((zone, *price)),
            }
        }
        best.map(|(zone, price)| (zone.clone(), price))
    }

    /// Whether `price` fits under `max_price`. A ceiling of zero or less means
    /// no ceiling.
    pub fn within_budget(price: f64, max_price: f64) -> bool {
        max_price <= 0.0 || price <= max_price
    }

    /// Split a node count into (spot, on-demand) for a mixed fleet
    ///
    /// The spot share is rounded down; percentages above 100 count as 100.
    pub fn split_capacity(total: u32, spot_percentage: u32) -> (u32, u32) {
        let pct = spot_percentage.min(100) as u64;
        let spot = (total as u64 * pct / 100) as u32;
        (spot, total - spot)
    }
}
