//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::local::{LocalProvisioner, LocalSpotProvider, LoggingNodeOps};
use super::{DistributeArgs, PlanArgs, RebalanceArgs, ServeArgs};
use crate::api::{create_router, ApiState};
use crate::autoscaling::{spawn_autoscaler, AutoscalingEngine, CloudProvisioner, DEFAULT_ZONE};
use crate::config::{load_config_file, ConfigError, ControlPlaneConfig};
use crate::events::{EventBus, EventType};
use crate::hooks::{HookEngine, HookError, Notifier};
use crate::metrics::new_shared_collector;
use crate::placement::{plan_moves, PlacementError, ZoneDistributionPlan, ZoneDistributor, ZoneMove};
use crate::spot::{SpotAwareProvisioner, SpotManager};
use crate::upgrade::{UpgradeConfig, UpgradeContext, UpgradeError, UpgradeOrchestrator, UpgradePlan};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Pure commands
// ============================================================================

/// Load and validate a configuration file
pub fn validate_config(path: &Path) -> CommandResult<ControlPlaneConfig> {
    Ok(load_config_file(path)?)
}

/// Distribute units with the configured placement policies
pub fn distribute(
    config: &ControlPlaneConfig,
    args: &DistributeArgs,
) -> CommandResult<ZoneDistributionPlan> {
    let zones = if args.zones.is_empty() {
        config.placement.zones.clone()
    } else {
        args.zones.clone()
    };
    let distributor = ZoneDistributor::from_config(&config.placement);
    let plan = match &args.strategy {
        Some(name) => distributor.distribute_with(name, args.units, &zones)?,
        None => distributor.distribute(args.units, &zones)?,
    };
    Ok(plan)
}

/// Per-zone deltas and the moves that realize them
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RebalanceOutcome {
    pub deltas: BTreeMap<String, i64>,
    pub moves: Vec<ZoneMove>,
}

pub fn rebalance(args: &RebalanceArgs) -> CommandResult<RebalanceOutcome> {
    let mut seen = HashSet::new();
    let mut current = BTreeMap::new();
    for (zone, count) in &args.counts {
        if !seen.insert(zone.as_str()) {
            return Err(PlacementError::DuplicateZone(zone.clone()).into());
        }
        current.insert(zone.clone(), *count);
    }
    if current.is_empty() {
        return Err(PlacementError::NoZones.into());
    }

    let deltas = crate::placement::rebalance(&current);
    let moves = plan_moves(&deltas);
    Ok(RebalanceOutcome { deltas, moves })
}

fn local_orchestrator(config: UpgradeConfig, notifier: Notifier) -> UpgradeOrchestrator {
    let ops = Arc::new(LoggingNodeOps);
    UpgradeOrchestrator::new(
        config,
        UpgradeContext::new(ops.clone(), ops.clone(), ops),
        notifier,
    )
}

/// Build an upgrade plan without executing it
pub fn plan(config: &ControlPlaneConfig, args: &PlanArgs) -> CommandResult<UpgradePlan> {
    let mut upgrade = config.upgrade.clone();
    if let Some(max) = args.max_unavailable {
        if max == 0 {
            return Err(CommandError::InvalidArgument(
                "--max-unavailable must be at least 1".to_string(),
            ));
        }
        upgrade.max_unavailable = max;
    }

    let orchestrator = local_orchestrator(upgrade, Notifier::default());
    if let Some(name) = &args.strategy {
        orchestrator.set_strategy(name)?;
    }
    Ok(orchestrator.plan(&args.from, &args.to, &args.nodes)?)
}

// ============================================================================
// Serve
// ============================================================================

/// Run the API and (optionally) the autoscaler until Ctrl-C
pub async fn serve(config: ControlPlaneConfig, args: &ServeArgs) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    let hooks = Arc::new(
        HookEngine::from_config(&config.hooks)
            .context("Failed to register configured hooks")?
            .with_event_bus(events.clone()),
    );
    let notifier = Notifier::new(events.clone()).with_hooks(hooks.clone());

    events.subscribe(EventType::HookFailed, |event: crate::events::Event| {
        warn!("Hook failed: {}", event.payload);
    });

    let shutdown = CancellationToken::new();
    let distributor = Arc::new(ZoneDistributor::from_config(&config.placement));
    let orchestrator = Arc::new(local_orchestrator(config.upgrade.clone(), notifier.clone()));

    let spot = Arc::new(SpotManager::new(notifier.clone()));
    spot.register_provider(Arc::new(LocalSpotProvider));

    let autoscaler_shutdown = if args.no_autoscaler || !config.autoscaling.enabled {
        info!("Autoscaler disabled");
        None
    } else {
        let zone = config
            .placement
            .zones
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_ZONE);
        let local = Arc::new(LocalProvisioner::new(config.autoscaling.min_nodes, zone));
        let provisioner: Arc<dyn CloudProvisioner> = if config.spot.enabled {
            info!(
                "Spot capacity enabled on '{}' ({}% of scale-ups)",
                config.spot.provider, config.spot.spot_percentage
            );
            Arc::new(
                SpotAwareProvisioner::new(local, spot.clone(), config.spot.clone())
                    .context("Failed to set up spot capacity")?
                    .with_cancellation(shutdown.child_token()),
            )
        } else {
            local
        };
        let engine = AutoscalingEngine::new(
            config.autoscaling.clone(),
            new_shared_collector(),
            provisioner,
        )
        .with_placement(distributor.clone(), config.placement.zones.clone())
        .with_notifier(notifier.clone());
        Some(spawn_autoscaler(Arc::new(engine)))
    };

    let host = args.bind_addr.as_deref().unwrap_or(&config.api.host);
    let port = args.port.unwrap_or(config.api.port);
    let addr = format!("{}:{}", host, port);

    let state = ApiState::new(orchestrator, distributor, hooks.clone())
        .with_spot(spot, config.spot.provider.clone())
        .with_shutdown(shutdown.clone());
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Control plane listening on {}", addr);
    info!("Registered {} hook(s)", hooks.list().len());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    if let Some(tx) = autoscaler_shutdown {
        let _ = tx.send(());
    }
    Ok(())
}
