//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::RebalanceOutcome;
use crate::config::ControlPlaneConfig;
use crate::placement::ZoneDistributionPlan;
use crate::upgrade::UpgradePlan;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Left-aligned columns separated by three spaces, upper-case headers
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "Nothing to show.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let render = |cells: &mut dyn Iterator<Item = String>| -> String {
        let line = cells
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("   ");
        format!("{}\n", line.trim_end())
    };

    let mut output = render(&mut headers.iter().map(|h| h.to_uppercase()));
    for row in rows {
        output.push_str(&render(&mut row.into_iter()));
    }
    output
}

// ============================================================================
// Placement display
// ============================================================================

pub fn format_distribution(plan: &ZoneDistributionPlan) -> String {
    let rows = plan
        .zone_counts
        .iter()
        .map(|(zone, count)| vec![zone.clone(), count.to_string()])
        .collect();

    let mut output = format!(
        "Strategy: {}\nTotal units: {}\n\n",
        plan.strategy_name, plan.total_units
    );
    output.push_str(&format_table(&["zone", "units"], rows));
    output
}

pub fn format_rebalance(outcome: &RebalanceOutcome) -> String {
    let rows = outcome
        .deltas
        .iter()
        .map(|(zone, delta)| vec![zone.clone(), format!("{:+}", delta)])
        .collect();
    let mut output = format_table(&["zone", "change"], rows);

    output.push('\n');
    if outcome.moves.is_empty() {
        output.push_str("Already balanced.\n");
    } else {
        for m in &outcome.moves {
            output.push_str(&format!("move {} from {} to {}\n", m.count, m.from, m.to));
        }
    }
    output
}

// ============================================================================
// Upgrade display
// ============================================================================

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m{:02}s", m, s),
        _ => format!("{}h{:02}m", h, m),
    }
}

pub fn format_plan(plan: &UpgradePlan) -> String {
    let mut output = format!(
        "Upgrade {} -> {} ({})\nStrategy: {}\nWaves: {}\nEstimated duration: {}\n\n",
        plan.current_version,
        plan.target_version,
        plan.id,
        plan.strategy_name,
        plan.total_waves,
        format_duration(plan.estimated_duration_secs)
    );

    let rows = plan
        .waves()
        .into_iter()
        .enumerate()
        .map(|(wave, nodes)| vec![(wave + 1).to_string(), nodes.join(", ")])
        .collect();
    output.push_str(&format_table(&["wave", "nodes"], rows));
    output
}

// ============================================================================
// Config display
// ============================================================================

pub fn format_config_summary(config: &ControlPlaneConfig) -> String {
    let scaling = &config.autoscaling;
    let mut output = String::from("✓ Configuration is valid\n\n");

    output.push_str(&format!(
        "Autoscaling: {} ({} strategy, {}-{} nodes, cooldown {}s)\n",
        if scaling.enabled { "enabled" } else { "disabled" },
        scaling.strategy,
        scaling.min_nodes,
        scaling.max_nodes,
        scaling.cooldown_seconds
    ));
    output.push_str(&format!(
        "Upgrades: {} (max unavailable {}, on failure {:?})\n",
        config.upgrade.strategy, config.upgrade.max_unavailable, config.upgrade.failure_policy
    ));
    output.push_str(&format!(
        "Spot: {}\n",
        if config.spot.enabled {
            format!(
                "enabled ({} {} on '{}', {}% of capacity, fallback {})",
                config.spot.instance_type,
                if config.spot.max_spot_price > 0.0 {
                    format!("up to {:.4}/h", config.spot.max_spot_price)
                } else {
                    "at market price".to_string()
                },
                config.spot.provider,
                config.spot.spot_percentage,
                if config.spot.fallback_on_demand { "on" } else { "off" }
            )
        } else {
            "disabled".to_string()
        }
    ));
    output.push_str(&format!(
        "Placement: {} over {}\n",
        config.placement.strategy,
        if config.placement.zones.is_empty() {
            "no zones".to_string()
        } else {
            config.placement.zones.join(", ")
        }
    ));
    output.push_str(&format!(
        "Hooks: {} registered\n",
        config.hooks.registrations.len()
    ));
    output.push_str(&format!("API: {}\n", config.api.bind_addr()));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::ZoneMove;
    use std::collections::BTreeMap;

    #[test]
    fn test_format_table() {
        let output = format_table(
            &["zone", "units"],
            vec![
                vec!["us-east-1a".into(), "4".into()],
                vec!["b".into(), "10".into()],
            ],
        );
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "ZONE         UNITS");
        assert_eq!(lines[1], "us-east-1a   4");
        assert_eq!(lines[2], "b            10");
    }

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["zone"], vec![]), "Nothing to show.\n");
    }

    #[test]
    fn test_format_distribution() {
        let counts: BTreeMap<String, u32> =
            [("a".to_string(), 3), ("b".to_string(), 2)].into_iter().collect();
        let output = format_distribution(&ZoneDistributionPlan::new(5, counts, "round_robin"));
        assert!(output.contains("Strategy: round_robin"));
        assert!(output.contains("Total units: 5"));
        assert!(output.contains("a      3"));
    }

    #[test]
    fn test_format_rebalance() {
        let outcome = RebalanceOutcome {
            deltas: [("a".to_string(), -2), ("b".to_string(), 2)]
                .into_iter()
                .collect(),
            moves: vec![ZoneMove {
                from: "a".into(),
                to: "b".into(),
                count: 2,
            }],
        };
        let output = format_rebalance(&outcome);
        assert!(output.contains("-2"));
        assert!(output.contains("+2"));
        assert!(output.contains("move 2 from a to b"));

        let balanced = RebalanceOutcome {
            deltas: [("a".to_string(), 0)].into_iter().collect(),
            moves: vec![],
        };
        assert!(format_rebalance(&balanced).contains("Already balanced."));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(600), "10m00s");
        assert_eq!(format_duration(6000), "1h40m");
    }

    #[test]
    fn test_format_config_summary() {
        let output = format_config_summary(&ControlPlaneConfig::default());
        assert!(output.contains("Configuration is valid"));
        assert!(output.contains("composite strategy, 1-10 nodes"));
        assert!(output.contains("Spot: disabled"));
        assert!(output.contains("API: 127.0.0.1:8080"));

        let mut config = ControlPlaneConfig::default();
        config.spot.enabled = true;
        let output = format_config_summary(&config);
        assert!(output.contains("Spot: enabled (m5.large at market price on 'local', 70%"));
    }
}
