//! Integration tests for upgrade execution against a scripted cluster
//!
//! The mock cluster records every collaborator call and can be told to fail
//! specific node/version pairs, hold upgrades behind a gate, or report nodes
//! as permanently unhealthy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use fleetplane::events::{Event, EventBus, EventType};
use fleetplane::hooks::Notifier;
use fleetplane::upgrade::{
    CollaboratorError, FailurePolicy, HealthChecker, NodeDrainer, NodeProvisioner,
    NodeUpgradeStatus, NodeUpgrader, UpgradeConfig, UpgradeContext, UpgradeError,
    UpgradeOrchestrator, UpgradePhase,
};

#[derive(Default)]
struct MockCluster {
    journal: Mutex<Vec<String>>,
    /// `node@version` pairs whose upgrade fails
    failing: Mutex<HashSet<String>>,
    unhealthy: Mutex<HashSet<String>>,
    gate: Option<Semaphore>,
}

impl MockCluster {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn upgrades(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|e| e.starts_with("upgrade "))
            .collect()
    }

    fn fail(&self, node: &str, version: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(format!("{}@{}", node, version));
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn release(&self, upgrades: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(upgrades);
        }
    }
}

#[async_trait]
impl NodeDrainer for MockCluster {
    async fn cordon(&self, node: &str) -> Result<(), CollaboratorError> {
        self.record(format!("cordon {}", node));
        Ok(())
    }

    async fn drain(&self, node: &str, _timeout: Duration) -> Result<(), CollaboratorError> {
        self.record(format!("drain {}", node));
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), CollaboratorError> {
        self.record(format!("uncordon {}", node));
        Ok(())
    }
}

#[async_trait]
impl NodeUpgrader for MockCluster {
    async fn upgrade_node(&self, node: &str, version: &str) -> Result<(), CollaboratorError> {
        self.record(format!("upgrade {} {}", node, version));
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self
            .failing
            .lock()
            .unwrap()
            .contains(&format!("{}@{}", node, version))
        {
            return Err(CollaboratorError::new("kubelet did not restart"));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for MockCluster {
    async fn is_node_healthy(&self, node: &str) -> Result<bool, CollaboratorError> {
        self.record(format!("health {}", node));
        Ok(!self.unhealthy.lock().unwrap().contains(node))
    }
}

#[async_trait]
impl NodeProvisioner for MockCluster {
    async fn provision_replacement(
        &self,
        node: &str,
        version: &str,
    ) -> Result<String, CollaboratorError> {
        self.record(format!("provision {} {}", node, version));
        Ok(format!("{}-new", node))
    }

    async fn cutover_traffic(&self, from: &str, to: &str) -> Result<(), CollaboratorError> {
        self.record(format!("cutover {} {}", from, to));
        Ok(())
    }

    async fn decommission(&self, node: &str) -> Result<(), CollaboratorError> {
        self.record(format!("decommission {}", node));
        Ok(())
    }
}

fn config(policy: FailurePolicy) -> UpgradeConfig {
    UpgradeConfig {
        failure_policy: policy,
        health_check_interval_seconds: 1,
        health_check_timeout_seconds: 1,
        ..Default::default()
    }
}

fn orchestrator(cluster: &Arc<MockCluster>, config: UpgradeConfig) -> Arc<UpgradeOrchestrator> {
    orchestrator_with(cluster, config, Notifier::default())
}

fn orchestrator_with(
    cluster: &Arc<MockCluster>,
    config: UpgradeConfig,
    notifier: Notifier,
) -> Arc<UpgradeOrchestrator> {
    let context = UpgradeContext::new(cluster.clone(), cluster.clone(), cluster.clone())
        .with_provisioner(cluster.clone());
    Arc::new(UpgradeOrchestrator::new(config, context, notifier))
}

fn nodes(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Poll until `cond` holds, failing the test after five seconds
async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_rolling_upgrade_completes_every_node() {
    let cluster = Arc::new(MockCluster::default());
    let bus = Arc::new(EventBus::new());
    let waves = Arc::new(AtomicUsize::new(0));
    let counter = waves.clone();
    bus.subscribe(EventType::WaveCompleted, move |_event: Event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let o = orchestrator_with(
        &cluster,
        UpgradeConfig {
            max_unavailable: 2,
            ..config(FailurePolicy::Propagate)
        },
        Notifier::new(bus),
    );
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2", "n3", "n4"])).unwrap();
    // min(2, ceil(4 / 4)) = 1 node per wave
    assert_eq!(plan.total_waves, 4);

    let status = o.execute(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(status.phase, UpgradePhase::Completed);
    assert_eq!(status.progress_percent, 100);
    assert_eq!(status.completed_nodes, nodes(&["n1", "n2", "n3", "n4"]));
    assert!(status.failed_nodes.is_empty());
    assert_eq!(o.status(), status);

    assert_eq!(
        &cluster.journal()[..5],
        &[
            "cordon n1",
            "drain n1",
            "upgrade n1 1.29",
            "uncordon n1",
            "health n1"
        ]
    );

    wait_for("wave events", || waves.load(Ordering::SeqCst) == 4).await;
}

#[tokio::test]
async fn test_blue_green_replaces_nodes() {
    let cluster = Arc::new(MockCluster::default());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    o.set_strategy("blue-green").unwrap();

    let plan = o.plan("1.28", "1.29", &nodes(&["n1"])).unwrap();
    o.execute(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(
        cluster.journal(),
        vec![
            "provision n1 1.29",
            "cordon n1",
            "drain n1",
            "cutover n1 n1-new",
            "decommission n1",
            "health n1-new"
        ]
    );
}

#[tokio::test]
async fn test_blue_green_without_provisioner() {
    let cluster = Arc::new(MockCluster::default());
    let context = UpgradeContext::new(cluster.clone(), cluster.clone(), cluster.clone());
    let o = UpgradeOrchestrator::new(
        config(FailurePolicy::Propagate),
        context,
        Notifier::default(),
    );
    o.set_strategy("blue-green").unwrap();

    let plan = o.plan("1.28", "1.29", &nodes(&["n1"])).unwrap();
    let err = o.execute(plan, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err, UpgradeError::ProvisionerRequired);
    assert_eq!(o.status().phase, UpgradePhase::Failed);
}

// ============================================================================
// Exclusivity and control
// ============================================================================

#[tokio::test]
async fn test_concurrent_execute_is_rejected() {
    let cluster = Arc::new(MockCluster::gated());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2"])).unwrap();

    let running = tokio::spawn({
        let o = o.clone();
        let plan = plan.clone();
        async move { o.execute(plan, CancellationToken::new()).await }
    });
    wait_for("first upgrade", || !cluster.upgrades().is_empty()).await;

    assert_eq!(
        o.execute(plan, CancellationToken::new()).await,
        Err(UpgradeError::AlreadyInProgress)
    );
    assert_eq!(
        o.plan("1.28", "1.29", &nodes(&["n9"])),
        Err(UpgradeError::AlreadyInProgress)
    );
    assert_eq!(o.set_strategy("surge"), Err(UpgradeError::AlreadyInProgress));
    assert!(o.is_running());

    cluster.release(2);
    let status = running.await.unwrap().unwrap();
    assert_eq!(status.phase, UpgradePhase::Completed);
    assert!(!o.is_running());
}

#[tokio::test]
async fn test_pause_and_resume_between_waves() {
    let cluster = Arc::new(MockCluster::gated());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2", "n3"])).unwrap();

    let running = tokio::spawn({
        let o = o.clone();
        async move { o.execute(plan, CancellationToken::new()).await }
    });
    wait_for("n1 upgrade", || cluster.upgrades().len() == 1).await;

    o.pause().unwrap();
    cluster.release(1);
    wait_for("paused", || o.status().phase == UpgradePhase::Paused).await;

    let status = o.status();
    assert_eq!(status.completed_nodes, nodes(&["n1"]));
    assert_eq!(cluster.upgrades().len(), 1);

    o.resume().unwrap();
    cluster.release(2);
    let status = running.await.unwrap().unwrap();
    assert_eq!(status.phase, UpgradePhase::Completed);
    assert_eq!(status.completed_nodes.len(), 3);
}

#[tokio::test]
async fn test_stop_ends_upgrade_at_wave_boundary() {
    let cluster = Arc::new(MockCluster::gated());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2", "n3"])).unwrap();

    let running = tokio::spawn({
        let o = o.clone();
        async move { o.execute(plan, CancellationToken::new()).await }
    });
    wait_for("n1 upgrade", || cluster.upgrades().len() == 1).await;

    o.stop().unwrap();
    cluster.release(1);

    assert_eq!(running.await.unwrap(), Err(UpgradeError::Stopped));
    let status = o.status();
    assert_eq!(status.phase, UpgradePhase::Stopped);
    assert_eq!(status.completed_nodes, nodes(&["n1"]));
    assert_eq!(cluster.upgrades(), vec!["upgrade n1 1.29"]);

    // The control channel went away with the execution
    assert_eq!(o.stop(), Err(UpgradeError::NotRunning));
}

#[tokio::test]
async fn test_cancellation_names_the_node() {
    let cluster = Arc::new(MockCluster::gated());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2"])).unwrap();
    let cancel = CancellationToken::new();

    let running = tokio::spawn({
        let o = o.clone();
        let cancel = cancel.clone();
        async move { o.execute(plan, cancel).await }
    });
    wait_for("n1 upgrade", || cluster.upgrades().len() == 1).await;
    cancel.cancel();

    assert_eq!(
        running.await.unwrap(),
        Err(UpgradeError::Cancelled("node n1".into()))
    );
    assert_eq!(o.status().phase, UpgradePhase::Stopped);
    assert!(!o.is_running());
}

// ============================================================================
// Failure policies
// ============================================================================

#[tokio::test]
async fn test_pause_on_failure_then_resume_retries_node() {
    let cluster = Arc::new(MockCluster::default());
    cluster.fail("n2", "1.29");
    let o = orchestrator(&cluster, config(FailurePolicy::PauseOnFailure));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2", "n3"])).unwrap();

    let running = tokio::spawn({
        let o = o.clone();
        async move { o.execute(plan, CancellationToken::new()).await }
    });
    wait_for("paused on failure", || {
        o.status().phase == UpgradePhase::PausedOnFailure
    })
    .await;

    let status = o.status();
    assert_eq!(status.failed_nodes, nodes(&["n2"]));
    assert!(status.error.as_deref().unwrap().contains("n2"));

    cluster.heal();
    o.resume().unwrap();

    let status = running.await.unwrap().unwrap();
    assert_eq!(status.phase, UpgradePhase::Completed);
    assert_eq!(status.completed_nodes, nodes(&["n1", "n2", "n3"]));
    assert!(status.failed_nodes.is_empty());
    assert_eq!(
        cluster
            .upgrades()
            .iter()
            .filter(|u| *u == "upgrade n2 1.29")
            .count(),
        2
    );
}

#[tokio::test]
async fn test_auto_rollback_reverts_completed_nodes_in_reverse() {
    let cluster = Arc::new(MockCluster::default());
    cluster.fail("n3", "1.29");
    let o = orchestrator(&cluster, config(FailurePolicy::AutoRollback));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2", "n3"])).unwrap();

    let err = o.execute(plan, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, UpgradeError::NodeFailed { ref node, .. } if node == "n3"));

    let status = o.status();
    assert_eq!(status.phase, UpgradePhase::RolledBack);
    assert!(status.completed_nodes.is_empty());
    assert_eq!(status.failed_nodes, nodes(&["n3"]));

    assert_eq!(
        cluster.upgrades(),
        vec![
            "upgrade n1 1.29",
            "upgrade n2 1.29",
            "upgrade n3 1.29",
            "upgrade n2 1.28",
            "upgrade n1 1.28"
        ]
    );

    let plan = o.current_plan().unwrap();
    assert_eq!(plan.node("n1").unwrap().status, NodeUpgradeStatus::RolledBack);
    assert_eq!(plan.node("n2").unwrap().status, NodeUpgradeStatus::RolledBack);
    assert_eq!(plan.node("n3").unwrap().status, NodeUpgradeStatus::Failed);
}

#[tokio::test]
async fn test_failed_rollback_reports_both_causes() {
    let cluster = Arc::new(MockCluster::default());
    cluster.fail("n2", "1.29");
    cluster.fail("n1", "1.28");
    let o = orchestrator(&cluster, config(FailurePolicy::AutoRollback));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2"])).unwrap();

    let err = o.execute(plan, CancellationToken::new()).await.unwrap_err();
    match err {
        UpgradeError::RollbackFailed { original, rollback } => {
            assert!(original.contains("n2"));
            assert!(rollback.contains("n1"));
        }
        other => panic!("expected RollbackFailed, got {:?}", other),
    }
    let status = o.status();
    assert_eq!(status.phase, UpgradePhase::Failed);
    assert_eq!(status.failed_nodes, nodes(&["n2", "n1"]));
    assert!(status.completed_nodes.is_empty());

    let plan = o.current_plan().unwrap();
    assert_eq!(plan.node("n1").unwrap().status, NodeUpgradeStatus::Failed);
    assert_eq!(plan.node("n2").unwrap().status, NodeUpgradeStatus::Failed);
}

#[tokio::test]
async fn test_propagate_fails_immediately() {
    let cluster = Arc::new(MockCluster::default());
    cluster.fail("n1", "1.29");
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2"])).unwrap();

    let err = o.execute(plan, CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Node n1 failed during upgrade: kubelet did not restart"
    );

    let status = o.status();
    assert_eq!(status.phase, UpgradePhase::Failed);
    assert_eq!(status.failed_nodes, nodes(&["n1"]));
    assert_eq!(cluster.upgrades(), vec!["upgrade n1 1.29"]);
}

#[tokio::test]
async fn test_health_check_timeout_fails_node() {
    let cluster = Arc::new(MockCluster::default());
    cluster.unhealthy.lock().unwrap().insert("n1".into());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1"])).unwrap();

    let err = o.execute(plan, CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        err,
        UpgradeError::HealthCheckTimeout {
            node: "n1".into(),
            seconds: 1
        }
    );
}

#[tokio::test]
async fn test_manual_rollback_after_completion() {
    let cluster = Arc::new(MockCluster::default());
    let o = orchestrator(&cluster, config(FailurePolicy::Propagate));
    let plan = o.plan("1.28", "1.29", &nodes(&["n1", "n2"])).unwrap();
    o.execute(plan, CancellationToken::new()).await.unwrap();

    let plan = o.current_plan().unwrap();
    let status = o.rollback(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(status.phase, UpgradePhase::RolledBack);
    assert!(status.completed_nodes.is_empty());

    let upgrades = cluster.upgrades();
    assert_eq!(&upgrades[2..], &["upgrade n2 1.28", "upgrade n1 1.28"]);
    assert!(o
        .current_plan()
        .unwrap()
        .nodes
        .iter()
        .all(|n| n.status == NodeUpgradeStatus::RolledBack));
}
