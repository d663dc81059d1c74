//! CLI module for fleetplane
//!
//! Subcommands:
//! - `fleetplane serve` - Run the API and the autoscaler loop
//! - `fleetplane validate` - Check a configuration file
//! - `fleetplane distribute` - Spread units across zones
//! - `fleetplane rebalance` - Compute moves that even out zone counts
//! - `fleetplane plan` - Preview an upgrade plan

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;
pub mod local;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "fleetplane")]
#[command(about = "Lifecycle control plane for multi-cloud Kubernetes clusters")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.fleetplane/config.yaml)
    #[arg(long, global = true, env = "FLEETPLANE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane API and autoscaler
    Serve(ServeArgs),

    /// Validate a configuration file
    Validate(ValidateArgs),

    /// Distribute units across zones
    Distribute(DistributeArgs),

    /// Compute a rebalance for current zone counts
    Rebalance(RebalanceArgs),

    /// Preview an upgrade plan
    Plan(PlanArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address (overrides api.host)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to listen on (overrides api.port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Run without the autoscaler loop
    #[arg(long)]
    pub no_autoscaler: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Configuration file (YAML or JSON)
    pub file: PathBuf,
}

/// Arguments for the distribute command
#[derive(Parser, Debug)]
pub struct DistributeArgs {
    /// Number of units to place
    #[arg(short, long)]
    pub units: u32,

    /// Zones, comma separated (defaults to placement.zones)
    #[arg(short, long, value_delimiter = ',')]
    pub zones: Vec<String>,

    /// Placement strategy (defaults to placement.strategy)
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the rebalance command
#[derive(Parser, Debug)]
pub struct RebalanceArgs {
    /// Current counts as zone=count
    #[arg(required = true, value_parser = parse_zone_count)]
    pub counts: Vec<(String, u32)>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Current cluster version
    #[arg(long)]
    pub from: String,

    /// Target cluster version
    #[arg(long)]
    pub to: String,

    /// Nodes to upgrade, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub nodes: Vec<String>,

    /// Upgrade strategy (defaults to upgrade.strategy)
    #[arg(short, long)]
    pub strategy: Option<String>,

    /// Override upgrade.maxUnavailable
    #[arg(long)]
    pub max_unavailable: Option<u32>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Parse `zone=count`
pub fn parse_zone_count(s: &str) -> Result<(String, u32), String> {
    let (zone, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected zone=count, got '{}'", s))?;
    let zone = zone.trim();
    if zone.is_empty() {
        return Err(format!("missing zone name in '{}'", s));
    }
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid count in '{}': {}", s, e))?;
    Ok((zone.to_string(), count))
}
