//! Autoscaling engine and background loop

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::strategies::{CompositeStrategy, CpuStrategy, CustomMetricStrategy, MemoryStrategy};
use super::{
    CloudProvisioner, MetricsCollector, ScaleDirection, ScalingConfig, ScalingDecision,
    ScalingError, ScalingStrategy,
};
use crate::events::EventType;
use crate::hooks::Notifier;
use crate::placement::ZoneDistributor;
use crate::registry::StrategyRegistry;

/// Zone used when no placement zones are configured
pub const DEFAULT_ZONE: &str = "default";

/// Cooldown bookkeeping
///
/// A single window applies to both directions: any scale operation
/// suppresses the next one for `cooldown_seconds`. `in_flight` is set while
/// a scale operation is talking to the provisioner.
#[derive(Debug, Clone, Default)]
pub struct AutoscalerState {
    pub last_scale_up: Option<DateTime<Utc>>,
    pub last_scale_down: Option<DateTime<Utc>>,
    pub last_decision: Option<ScalingDecision>,
    pub in_flight: bool,
}

impl AutoscalerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scale_up(&mut self) {
        self.last_scale_up = Some(Utc::now());
    }

    pub fn record_scale_down(&mut self) {
        self.last_scale_down = Some(Utc::now());
    }

    /// Most recent scale operation in either direction
    pub fn last_scale(&self) -> Option<DateTime<Utc>> {
        self.last_scale_up.max(self.last_scale_down)
    }

    /// Seconds left in the cooldown window, if inside it
    pub fn cooldown_remaining(&self, cooldown_seconds: u64) -> Option<u64> {
        let last = self.last_scale()?;
        let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
        if elapsed < cooldown_seconds {
            Some(cooldown_seconds - elapsed)
        } else {
            None
        }
    }

    pub fn can_scale(&self, cooldown_seconds: u64) -> bool {
        self.cooldown_remaining(cooldown_seconds).is_none()
    }
}

/// Claim on the engine's single scale slot
///
/// Dropping the slot without [`ScaleSlot::commit`] releases it without
/// starting a cooldown, so a failed provisioner call can be retried.
struct ScaleSlot<'a> {
    engine: &'a AutoscalingEngine,
}

impl ScaleSlot<'_> {
    fn commit(self, direction: ScaleDirection) {
        let mut state = self.engine.lock_state();
        match direction {
            ScaleDirection::Up => state.record_scale_up(),
            ScaleDirection::Down => state.record_scale_down(),
            ScaleDirection::None => {}
        }
    }
}

impl Drop for ScaleSlot<'_> {
    fn drop(&mut self) {
        self.engine.lock_state().in_flight = false;
    }
}

/// Evaluates scaling strategies and applies their decisions
pub struct AutoscalingEngine {
    config: ScalingConfig,
    strategies: StrategyRegistry<dyn ScalingStrategy>,
    metrics: Arc<dyn MetricsCollector>,
    provisioner: Arc<dyn CloudProvisioner>,
    distributor: Arc<ZoneDistributor>,
    zones: Vec<String>,
    notifier: Notifier,
    state: Mutex<AutoscalerState>,
}

impl AutoscalingEngine {
    /// Engine with the built-in strategies registered
    ///
    /// The custom-metric strategy is registered only when the config names
    /// a custom metric.
    pub fn new(
        config: ScalingConfig,
        metrics: Arc<dyn MetricsCollector>,
        provisioner: Arc<dyn CloudProvisioner>,
    ) -> Self {
        let strategies: StrategyRegistry<dyn ScalingStrategy> = StrategyRegistry::new();
        strategies.register(Arc::new(CpuStrategy));
        strategies.register(Arc::new(MemoryStrategy));
        strategies.register(Arc::new(CompositeStrategy::default()));
        if let Some(custom) = &config.custom_metric {
            strategies.register(Arc::new(CustomMetricStrategy::from_config(custom)));
        }

        Self {
            config,
            strategies,
            metrics,
            provisioner,
            distributor: Arc::new(ZoneDistributor::new()),
            zones: vec![DEFAULT_ZONE.to_string()],
            notifier: Notifier::default(),
            state: Mutex::new(AutoscalerState::new()),
        }
    }

    /// Place new nodes across `zones` with the given distributor
    pub fn with_placement(mut self, distributor: Arc<ZoneDistributor>, zones: Vec<String>) -> Self {
        self.distributor = distributor;
        if !zones.is_empty() {
            self.zones = zones;
        }
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Add or replace a scaling strategy
    pub fn register_strategy(&self, strategy: Arc<dyn ScalingStrategy>) {
        self.strategies.register(strategy);
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.list()
    }

    /// Snapshot of cooldown state and the last decision
    pub fn state(&self) -> AutoscalerState {
        self.lock_state().clone()
    }

    pub fn last_decision(&self) -> Option<ScalingDecision> {
        self.lock_state().last_decision.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, AutoscalerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_remaining(&self) -> Option<u64> {
        self.lock_state()
            .cooldown_remaining(self.config.cooldown_seconds)
    }

    /// Check the cooldown and claim the scale slot in one critical section
    fn reserve_scale(&self) -> Result<ScaleSlot<'_>, ScalingError> {
        if !self.config.enabled {
            return Err(ScalingError::Disabled);
        }
        let mut state = self.lock_state();
        if state.in_flight {
            return Err(ScalingError::ScaleInProgress);
        }
        if let Some(remaining) = state.cooldown_remaining(self.config.cooldown_seconds) {
            return Err(ScalingError::CooldownActive(remaining));
        }
        state.in_flight = true;
        Ok(ScaleSlot { engine: self })
    }

    /// Decide what to do for the current node count
    ///
    /// Metric failures produce a `none` decision. Only configuration errors
    /// (an unknown strategy name) are returned as errors.
    pub async fn evaluate(&self, current_nodes: u32) -> Result<ScalingDecision, ScalingError> {
        let cfg = &self.config;
        if !cfg.enabled {
            return Ok(ScalingDecision::none("autoscaling disabled"));
        }

        if self.lock_state().in_flight {
            return Ok(ScalingDecision::none("scale operation in progress"));
        }
        if let Some(remaining) = self.cooldown_remaining() {
            return Ok(ScalingDecision::none(format!(
                "cooldown ({}s remaining)",
                remaining
            )));
        }

        if current_nodes < cfg.min_nodes {
            return Ok(ScalingDecision::up(
                cfg.min_nodes - current_nodes,
                format!("below minimum of {} node(s)", cfg.min_nodes),
            ));
        }
        if current_nodes > cfg.max_nodes {
            return Ok(ScalingDecision::down(
                current_nodes - cfg.max_nodes,
                format!("above maximum of {} node(s)", cfg.max_nodes),
            ));
        }

        let strategy = self.strategies.get(&cfg.strategy)?;

        let up = match strategy.should_scale_up(self.metrics.as_ref(), cfg).await {
            Ok(rec) => rec,
            Err(ScalingError::Metrics(e)) => {
                warn!("Skipping autoscaling cycle: {}", e);
                return Ok(ScalingDecision::none(e.to_string()));
            }
            Err(e) => return Err(e),
        };
        if up.scale {
            let target = current_nodes.saturating_add(up.nodes).min(cfg.max_nodes);
            let delta = target - current_nodes;
            if delta == 0 {
                return Ok(ScalingDecision::none(format!(
                    "'{}' wants to scale up but already at maximum of {} node(s)",
                    cfg.strategy, cfg.max_nodes
                )));
            }
            return Ok(ScalingDecision::up(
                delta,
                format!("'{}' recommends +{} node(s)", cfg.strategy, up.nodes),
            ));
        }

        let down = match strategy.should_scale_down(self.metrics.as_ref(), cfg).await {
            Ok(rec) => rec,
            Err(ScalingError::Metrics(e)) => {
                warn!("Skipping autoscaling cycle: {}", e);
                return Ok(ScalingDecision::none(e.to_string()));
            }
            Err(e) => return Err(e),
        };
        if down.scale {
            let target = current_nodes.saturating_sub(down.nodes).max(cfg.min_nodes);
            let delta = current_nodes.saturating_sub(target);
            if delta == 0 {
                return Ok(ScalingDecision::none(format!(
                    "'{}' wants to scale down but already at minimum of {} node(s)",
                    cfg.strategy, cfg.min_nodes
                )));
            }
            return Ok(ScalingDecision::down(
                delta,
                format!("'{}' recommends -{} node(s)", cfg.strategy, down.nodes),
            ));
        }

        Ok(ScalingDecision::none("within target range"))
    }

    /// Add `count` nodes spread across the configured zones
    pub async fn scale_up(&self, count: u32) -> Result<Vec<String>, ScalingError> {
        let slot = self.reserve_scale()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let placement = self.distributor.distribute(count, &self.zones)?;
        let payload = json!({
            "count": count,
            "placement": placement.zone_counts,
        });
        self.notifier.notify(EventType::PreScaleUp, payload).await;

        info!("Scaling up by {} node(s)", count);
        let nodes = self.provisioner.provision_nodes(&placement).await?;
        slot.commit(ScaleDirection::Up);

        self.notifier
            .notify(
                EventType::PostScaleUp,
                json!({
                    "count": count,
                    "nodes": nodes,
                    "placement": placement.zone_counts,
                }),
            )
            .await;

        Ok(nodes)
    }

    /// Remove `count` nodes
    pub async fn scale_down(&self, count: u32) -> Result<Vec<String>, ScalingError> {
        let slot = self.reserve_scale()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        self.notifier
            .notify(EventType::PreScaleDown, json!({ "count": count }))
            .await;

        info!("Scaling down by {} node(s)", count);
        let nodes = self.provisioner.decommission_nodes(count).await?;
        slot.commit(ScaleDirection::Down);

        self.notifier
            .notify(
                EventType::PostScaleDown,
                json!({ "count": count, "nodes": nodes }),
            )
            .await;

        Ok(nodes)
    }

    /// One full cycle: read node count, evaluate, apply
    pub async fn reconcile(&self) -> Result<ScalingDecision, ScalingError> {
        let current = self.provisioner.current_node_count().await?;
        let decision = self.evaluate(current).await?;

        debug!(
            "Autoscaling decision for {} node(s): {:?} {} ({})",
            current, decision.direction, decision.node_count, decision.reason
        );
        self.notifier.announce(
            EventType::ScalingDecision,
            serde_json::to_value(&decision).unwrap_or_default(),
        );
        self.lock_state().last_decision = Some(decision.clone());

        match decision.direction {
            ScaleDirection::Up if decision.node_count > 0 => {
                self.scale_up(decision.node_count).await?;
            }
            ScaleDirection::Down if decision.node_count > 0 => {
                self.scale_down(decision.node_count).await?;
            }
            _ => {}
        }

        Ok(decision)
    }
}

/// Spawn the autoscaler as a background task
pub fn spawn_autoscaler(engine: Arc<AutoscalingEngine>) -> watch::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    let period = Duration::from_secs(engine.config().evaluation_interval_seconds.max(1));

    tokio::spawn(async move {
        let mut ticker = interval(period);

        info!("Autoscaler started, evaluating every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.reconcile().await {
                        Ok(decision) if decision.is_change() => {
                            info!("Autoscaler applied: {}", decision.reason);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Autoscaling cycle failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Autoscaler shutting down");
                    break;
                }
            }
        }
    });

    shutdown_tx
}
