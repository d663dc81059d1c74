//! Upgrade orchestrator
//!
//! Owns the single live plan/status pair behind one mutex. Only one
//! execution (upgrade or rollback) may run at a time; while it runs, the
//! orchestrator holds the sending half of an unbounded control channel so
//! that `pause`, `resume` and `stop` never block the caller.

use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::strategies::{BlueGreenStrategy, CanaryStrategy, RollingStrategy, SurgeStrategy};
use super::{
    FailurePolicy, NodePlan, NodeUpgradeStatus, UpgradeConfig, UpgradeContext, UpgradeError,
    UpgradePhase, UpgradePlan, UpgradeStatus, UpgradeStrategy,
};
use crate::events::EventType;
use crate::hooks::Notifier;
use crate::registry::{RegistryError, StrategyRegistry};

/// Operator signal delivered to a running execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

/// What the wave loop does after looking at control signals
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Shared {
    plan: Option<UpgradePlan>,
    status: UpgradeStatus,
    strategy: String,
    running: bool,
    control: Option<UnboundedSender<ControlSignal>>,
}

/// Releases the execution claim however `execute`/`rollback` exits
struct ExecutionGuard<O: Deref<Target = UpgradeOrchestrator>> {
    orchestrator: O,
}

impl<O: Deref<Target = UpgradeOrchestrator>> Drop for ExecutionGuard<O> {
    fn drop(&mut self) {
        let mut shared = self.orchestrator.lock();
        shared.running = false;
        shared.control = None;
        if shared.status.phase.is_active() {
            shared.status.phase = UpgradePhase::Failed;
            shared.status.error = Some("execution aborted".to_string());
            shared.status.finished_at = Some(Utc::now());
        }
    }
}

/// A claimed plan, ready to run
struct Execution {
    strategy: Arc<dyn UpgradeStrategy>,
    control: UnboundedReceiver<ControlSignal>,
    waves: Vec<Vec<String>>,
    plan_id: Uuid,
    target: String,
}

pub struct UpgradeOrchestrator {
    config: UpgradeConfig,
    strategies: StrategyRegistry<dyn UpgradeStrategy>,
    context: UpgradeContext,
    notifier: Notifier,
    state: Mutex<Shared>,
}

impl UpgradeOrchestrator {
    /// Orchestrator with the four built-in strategies
    pub fn new(config: UpgradeConfig, context: UpgradeContext, notifier: Notifier) -> Self {
        let strategies: StrategyRegistry<dyn UpgradeStrategy> = StrategyRegistry::new();
        strategies.register(Arc::new(RollingStrategy));
        strategies.register(Arc::new(CanaryStrategy::new(config.canary_percent)));
        strategies.register(Arc::new(BlueGreenStrategy));
        strategies.register(Arc::new(SurgeStrategy));

        let context = context.with_drain_timeout(config.drain_timeout());
        let strategy = config.strategy.clone();

        Self {
            config,
            strategies,
            context,
            notifier,
            state: Mutex::new(Shared {
                plan: None,
                status: UpgradeStatus::idle(),
                strategy,
                running: false,
                control: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.lock();
        f(&mut shared)
    }

    /// Add or replace a strategy
    pub fn register_strategy(&self, strategy: Arc<dyn UpgradeStrategy>) {
        self.strategies.register(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.list()
    }

    pub fn active_strategy(&self) -> String {
        self.lock().strategy.clone()
    }

    /// Select the strategy used by the next `plan`
    pub fn set_strategy(&self, name: &str) -> Result<(), UpgradeError> {
        let mut shared = self.lock();
        if shared.running {
            return Err(UpgradeError::AlreadyInProgress);
        }
        if !self.strategies.contains(name) {
            return Err(RegistryError::NotFound(name.to_string()).into());
        }
        info!("Upgrade strategy set to '{}'", name);
        shared.strategy = name.to_string();
        Ok(())
    }

    pub fn status(&self) -> UpgradeStatus {
        self.lock().status.clone()
    }

    pub fn current_plan(&self) -> Option<UpgradePlan> {
        self.lock().plan.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    /// Build and store a plan for upgrading `nodes` to `target_version`
    pub fn plan(
        &self,
        current_version: &str,
        target_version: &str,
        nodes: &[String],
    ) -> Result<UpgradePlan, UpgradeError> {
        let mut shared = self.lock();
        if shared.running {
            return Err(UpgradeError::AlreadyInProgress);
        }
        if nodes.is_empty() {
            return Err(UpgradeError::NoNodes);
        }
        validate_versions(current_version, target_version)?;
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].contains(node) {
                return Err(UpgradeError::DuplicateNode(node.clone()));
            }
        }

        let strategy = self.strategies.get(&shared.strategy)?;
        let batch = strategy
            .batch_size(nodes.len(), self.config.max_unavailable as usize)
            .max(1);

        let plan_nodes: Vec<NodePlan> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| NodePlan {
                node: node.clone(),
                wave: (i / batch) as u32,
                status: NodeUpgradeStatus::Pending,
            })
            .collect();

        let plan = UpgradePlan {
            id: Uuid::new_v4(),
            current_version: current_version.to_string(),
            target_version: target_version.to_string(),
            strategy_name: strategy.name().to_string(),
            total_waves: nodes.len().div_ceil(batch) as u32,
            estimated_duration_secs: nodes.len() as u64 * self.config.node_estimate_seconds,
            nodes: plan_nodes,
            created_at: Utc::now(),
        };

        info!(
            "Planned upgrade {} -> {} for {} node(s) in {} wave(s) using '{}'",
            current_version,
            target_version,
            nodes.len(),
            plan.total_waves,
            plan.strategy_name
        );

        shared.status = UpgradeStatus::planned(plan.id);
        shared.plan = Some(plan.clone());
        Ok(plan)
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    fn send(&self, signal: ControlSignal) -> Result<(), UpgradeError> {
        let shared = self.lock();
        let tx = shared.control.as_ref().ok_or(UpgradeError::NotRunning)?;
        tx.send(signal).map_err(|_| UpgradeError::NotRunning)?;
        debug!("Sent {:?} to running upgrade", signal);
        Ok(())
    }

    /// Pause before the next wave
    pub fn pause(&self) -> Result<(), UpgradeError> {
        self.send(ControlSignal::Pause)
    }

    /// Continue a paused upgrade, or retry the failed node
    pub fn resume(&self) -> Result<(), UpgradeError> {
        self.send(ControlSignal::Resume)
    }

    /// End the running upgrade at the next wave boundary
    pub fn stop(&self) -> Result<(), UpgradeError> {
        self.send(ControlSignal::Stop)
    }

    /// Claim the orchestrator for one execution
    ///
    /// The caller must wrap the orchestrator in an [`ExecutionGuard`]
    /// straight after a successful claim.
    fn claim(
        &self,
        plan: Option<UpgradePlan>,
        phase: UpgradePhase,
    ) -> Result<UnboundedReceiver<ControlSignal>, UpgradeError> {
        let mut shared = self.lock();
        if shared.running {
            return Err(UpgradeError::AlreadyInProgress);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.running = true;
        shared.control = Some(tx);

        if let Some(plan) = plan {
            let mut status = UpgradeStatus::planned(plan.id);
            status.completed_nodes = plan.nodes_with_status(NodeUpgradeStatus::Completed);
            shared.status = status;
            shared.plan = Some(plan);
        }
        shared.status.phase = phase;
        shared.status.started_at = Some(Utc::now());
        shared.status.finished_at = None;
        shared.status.error = None;

        Ok(rx)
    }

    fn set_phase(&self, phase: UpgradePhase) {
        self.update(|s| s.status.phase = phase);
    }

    fn finish(&self, phase: UpgradePhase, error: Option<String>) -> UpgradeStatus {
        self.update(|s| {
            s.status.phase = phase;
            s.status.error = error;
            s.status.current_node = None;
            s.status.finished_at = Some(Utc::now());
            s.status.clone()
        })
    }

    /// Non-blocking look at queued signals between waves
    async fn check_control(
        &self,
        rx: &mut UnboundedReceiver<ControlSignal>,
        cancel: &CancellationToken,
    ) -> Result<Flow, UpgradeError> {
        loop {
            match rx.try_recv() {
                Ok(ControlSignal::Pause) => {
                    return self.wait_for_resume(rx, cancel, UpgradePhase::Paused).await;
                }
                Ok(ControlSignal::Resume) => continue,
                Ok(ControlSignal::Stop) => return Ok(Flow::Stop),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    return Ok(Flow::Continue)
                }
            }
        }
    }

    /// Block in `phase` until Resume or Stop arrives
    async fn wait_for_resume(
        &self,
        rx: &mut UnboundedReceiver<ControlSignal>,
        cancel: &CancellationToken,
        phase: UpgradePhase,
    ) -> Result<Flow, UpgradeError> {
        self.set_phase(phase);
        info!("Upgrade {}", phase);
        self.notifier
            .announce(EventType::UpgradePaused, json!({ "phase": phase }));

        loop {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(UpgradeError::Cancelled(format!("{} upgrade", phase)));
                }
                signal = rx.recv() => signal,
            };

            match signal {
                Some(ControlSignal::Resume) => {
                    self.set_phase(UpgradePhase::Executing);
                    info!("Upgrade resumed");
                    self.notifier
                        .announce(EventType::UpgradeResumed, json!({}));
                    return Ok(Flow::Continue);
                }
                Some(ControlSignal::Stop) | None => return Ok(Flow::Stop),
                Some(ControlSignal::Pause) => continue,
            }
        }
    }

    fn stopped(&self) -> UpgradeError {
        let status = self.finish(UpgradePhase::Stopped, None);
        warn!(
            "Upgrade stopped with {} node(s) completed",
            status.completed_nodes.len()
        );
        self.notifier.announce(
            EventType::UpgradeStopped,
            json!({ "completedNodes": status.completed_nodes }),
        );
        UpgradeError::Stopped
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Run a plan to completion
    ///
    /// Returns the final status on success. Every other outcome (stopped,
    /// failed, rolled back, cancelled) is an error; `status()` then shows the
    /// terminal phase.
    pub async fn execute(
        &self,
        plan: UpgradePlan,
        cancel: CancellationToken,
    ) -> Result<UpgradeStatus, UpgradeError> {
        let execution = self.begin(plan)?;
        let _guard = ExecutionGuard { orchestrator: self };
        self.run(execution, cancel).await
    }

    /// Claim the orchestrator now and run `plan` on a spawned task
    ///
    /// Rejections (`AlreadyInProgress`, invalid plan, unknown strategy) are
    /// returned before anything is spawned.
    pub fn start(
        self: &Arc<Self>,
        plan: UpgradePlan,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<UpgradeStatus, UpgradeError>>, UpgradeError> {
        let execution = self.begin(plan)?;
        let guard = ExecutionGuard {
            orchestrator: Arc::clone(self),
        };
        Ok(tokio::spawn(async move {
            let result = guard.orchestrator.run(execution, cancel).await;
            drop(guard);
            result
        }))
    }

    fn begin(&self, plan: UpgradePlan) -> Result<Execution, UpgradeError> {
        plan.validate()?;
        let strategy = self.strategies.get(&plan.strategy_name)?;
        let waves = plan.waves();
        let plan_id = plan.id;
        let target = plan.target_version.clone();
        let control = self.claim(Some(plan), UpgradePhase::Executing)?;
        Ok(Execution {
            strategy,
            control,
            waves,
            plan_id,
            target,
        })
    }

    async fn run(
        &self,
        execution: Execution,
        cancel: CancellationToken,
    ) -> Result<UpgradeStatus, UpgradeError> {
        let Execution {
            strategy,
            control: mut rx,
            waves,
            plan_id,
            target,
        } = execution;
        let total_waves = waves.len().max(1) as u32;

        info!("Starting upgrade {} to {}", plan_id, target);
        self.notifier
            .notify(
                EventType::PreUpgrade,
                json!({ "planId": plan_id, "targetVersion": target }),
            )
            .await;
        self.notifier.announce(
            EventType::UpgradeStarted,
            json!({ "planId": plan_id, "waves": total_waves }),
        );

        for (wave, nodes) in waves.iter().enumerate() {
            match self.check_control(&mut rx, &cancel).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Err(self.stopped()),
                Err(e) => {
                    self.finish(UpgradePhase::Stopped, Some(e.to_string()));
                    return Err(e);
                }
            }

            self.update(|s| s.status.current_wave = Some(wave as u32));
            debug!("Wave {}/{}: {:?}", wave + 1, total_waves, nodes);

            let mut i = 0;
            while i < nodes.len() {
                let node = &nodes[i];
                let err = match self.upgrade_one(strategy.as_ref(), node, &target, &cancel).await {
                    Ok(()) => {
                        self.update(|s| {
                            s.status.completed_nodes.push(node.clone());
                            s.status.failed_nodes.retain(|n| n != node);
                            if let Some(plan) = s.plan.as_mut() {
                                plan.set_node_status(node, NodeUpgradeStatus::Completed);
                            }
                        });
                        self.notifier
                            .notify(
                                EventType::NodeUpgraded,
                                json!({ "node": node, "version": target, "wave": wave }),
                            )
                            .await;
                        i += 1;
                        continue;
                    }
                    Err(e) => e,
                };

                self.record_node_failure(node, &err);
                if let UpgradeError::Cancelled(_) = err {
                    self.finish(UpgradePhase::Stopped, Some(err.to_string()));
                    return Err(err);
                }

                match self.config.failure_policy {
                    FailurePolicy::PauseOnFailure => {
                        self.update(|s| s.status.error = Some(err.to_string()));
                        match self
                            .wait_for_resume(&mut rx, &cancel, UpgradePhase::PausedOnFailure)
                            .await
                        {
                            Ok(Flow::Continue) => {
                                info!("Retrying node {}", node);
                                self.update(|s| s.status.error = None);
                            }
                            Ok(Flow::Stop) => return Err(self.stopped()),
                            Err(e) => {
                                self.finish(UpgradePhase::Stopped, Some(e.to_string()));
                                return Err(e);
                            }
                        }
                    }
                    FailurePolicy::AutoRollback => {
                        return Err(self.auto_rollback(strategy.as_ref(), err, &cancel).await);
                    }
                    FailurePolicy::Propagate => {
                        self.finish(UpgradePhase::Failed, Some(err.to_string()));
                        self.notifier
                            .notify(
                                EventType::UpgradeFailed,
                                json!({ "planId": plan_id, "error": err.to_string() }),
                            )
                            .await;
                        return Err(err);
                    }
                }
            }

            let progress = (wave as u32 + 1) * 100 / total_waves;
            self.update(|s| s.status.progress_percent = progress);
            info!("Wave {}/{} complete ({}%)", wave + 1, total_waves, progress);
            self.notifier.announce(
                EventType::WaveCompleted,
                json!({ "wave": wave, "progress": progress }),
            );
        }

        self.update(|s| {
            s.status.progress_percent = 100;
            s.status.current_wave = None;
        });
        let status = self.finish(UpgradePhase::Completed, None);
        info!(
            "Upgrade {} completed: {} node(s) at {}",
            plan_id,
            status.completed_nodes.len(),
            target
        );

        self.notifier
            .notify(
                EventType::PostUpgrade,
                json!({ "planId": plan_id, "targetVersion": target }),
            )
            .await;
        self.notifier.announce(
            EventType::UpgradeCompleted,
            json!({ "planId": plan_id, "nodes": status.completed_nodes }),
        );

        Ok(status)
    }

    fn record_node_failure(&self, node: &str, err: &UpgradeError) {
        error!("Node {} failed: {}", node, err);
        self.update(|s| {
            if !s.status.failed_nodes.iter().any(|n| n == node) {
                s.status.failed_nodes.push(node.to_string());
            }
            if let Some(plan) = s.plan.as_mut() {
                plan.set_node_status(node, NodeUpgradeStatus::Failed);
            }
        });
        self.notifier.announce(
            EventType::NodeUpgradeFailed,
            json!({ "node": node, "error": err.to_string() }),
        );
    }

    /// Race one node step against cancellation
    async fn step<T>(
        &self,
        cancel: &CancellationToken,
        node: &str,
        fut: impl Future<Output = Result<T, UpgradeError>>,
    ) -> Result<T, UpgradeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpgradeError::Cancelled(format!("node {}", node))),
            result = fut => result,
        }
    }

    /// prepare, upgrade, validate, then wait for the health check
    async fn upgrade_one(
        &self,
        strategy: &dyn UpgradeStrategy,
        node: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UpgradeError> {
        self.update(|s| {
            s.status.current_node = Some(node.to_string());
            if let Some(plan) = s.plan.as_mut() {
                plan.set_node_status(node, NodeUpgradeStatus::InProgress);
            }
        });

        let ctx = &self.context;
        debug!("Upgrading {} to {}", node, version);
        self.step(cancel, node, strategy.prepare_node(ctx, node, version))
            .await?;
        self.step(cancel, node, strategy.upgrade_node(ctx, node, version))
            .await?;
        let check = self
            .step(cancel, node, strategy.validate_node(ctx, node, version))
            .await?;
        self.step(cancel, node, self.wait_healthy(&check)).await
    }

    /// Poll the health checker until healthy or the timeout elapses
    async fn wait_healthy(&self, node: &str) -> Result<(), UpgradeError> {
        let interval = self.config.health_check_interval();
        let poll = async {
            loop {
                match self.context.health.is_node_healthy(node).await {
                    Ok(true) => return,
                    Ok(false) => debug!("Node {} not healthy yet", node),
                    Err(e) => debug!("Health check for {} failed: {}", node, e),
                }
                tokio::time::sleep(interval).await;
            }
        };

        tokio::time::timeout(self.config.health_check_timeout(), poll)
            .await
            .map_err(|_| UpgradeError::HealthCheckTimeout {
                node: node.to_string(),
                seconds: self.config.health_check_timeout_seconds,
            })
    }

    // ------------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------------

    async fn auto_rollback(
        &self,
        strategy: &dyn UpgradeStrategy,
        original: UpgradeError,
        cancel: &CancellationToken,
    ) -> UpgradeError {
        warn!("Rolling back after failure: {}", original);
        self.set_phase(UpgradePhase::RollingBack);

        match self.rollback_completed(strategy, cancel).await {
            Ok(()) => {
                self.finish(UpgradePhase::RolledBack, Some(original.to_string()));
                self.notifier
                    .notify(
                        EventType::UpgradeRolledBack,
                        json!({ "reason": original.to_string() }),
                    )
                    .await;
                original
            }
            Err(rollback) => {
                let err = UpgradeError::RollbackFailed {
                    original: original.to_string(),
                    rollback: rollback.to_string(),
                };
                self.finish(UpgradePhase::Failed, Some(err.to_string()));
                self.notifier
                    .notify(EventType::UpgradeFailed, json!({ "error": err.to_string() }))
                    .await;
                err
            }
        }
    }

    /// Return completed nodes to the plan's current version, newest first.
    /// The first failure ends the rollback.
    async fn rollback_completed(
        &self,
        strategy: &dyn UpgradeStrategy,
        cancel: &CancellationToken,
    ) -> Result<(), UpgradeError> {
        let (nodes, version) = self.update(|s| {
            let plan = s.plan.as_ref();
            let mut nodes = plan
                .map(|p| p.nodes_with_status(NodeUpgradeStatus::Completed))
                .unwrap_or_default();
            nodes.reverse();
            let version = plan.map(|p| p.current_version.clone()).unwrap_or_default();
            (nodes, version)
        });

        for node in nodes {
            info!("Rolling back {} to {}", node, version);
            if let Err(e) = self.upgrade_one(strategy, &node, &version, cancel).await {
                self.record_node_failure(&node, &e);
                self.update(|s| s.status.completed_nodes.retain(|n| n != &node));
                return Err(e);
            }
            self.update(|s| {
                s.status.completed_nodes.retain(|n| n != &node);
                if let Some(plan) = s.plan.as_mut() {
                    plan.set_node_status(&node, NodeUpgradeStatus::RolledBack);
                }
            });
        }
        Ok(())
    }

    /// Roll back every completed node of `plan`
    pub async fn rollback(
        &self,
        plan: UpgradePlan,
        cancel: CancellationToken,
    ) -> Result<UpgradeStatus, UpgradeError> {
        let strategy = self.strategies.get(&plan.strategy_name)?;
        let plan_id = plan.id;
        let _rx = self.claim(Some(plan), UpgradePhase::RollingBack)?;
        let _guard = ExecutionGuard { orchestrator: self };

        info!("Rolling back upgrade {}", plan_id);
        match self.rollback_completed(strategy.as_ref(), &cancel).await {
            Ok(()) => {
                let status = self.finish(UpgradePhase::RolledBack, None);
                self.notifier
                    .notify(EventType::UpgradeRolledBack, json!({ "planId": plan_id }))
                    .await;
                Ok(status)
            }
            Err(e) => {
                self.finish(UpgradePhase::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }
}

fn validate_versions(current: &str, target: &str) -> Result<(), UpgradeError> {
    if current.trim().is_empty() || target.trim().is_empty() {
        return Err(UpgradeError::InvalidVersion(
            "versions must not be empty".to_string(),
        ));
    }
    if current == target {
        return Err(UpgradeError::InvalidVersion(format!(
            "already at {}",
            target
        )));
    }
    Ok(())
}
