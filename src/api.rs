//! Control plane HTTP API
//!
//! - Health: `GET /health`
//! - Upgrades: status, plan, execute, pause/resume/stop
//! - Placement: distribute and rebalance calculations
//! - Spot: interruption notices
//! - Hooks: list registrations

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::hooks::HookEngine;
use crate::placement::{plan_moves, PlacementError, ZoneDistributor, ZoneMove};
use crate::registry::RegistryError;
use crate::spot::{SpotError, SpotManager};
use crate::upgrade::{UpgradeError, UpgradeOrchestrator};

/// Result body for control operations and errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub success: bool,
    pub message: String,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(OperationStatus::failure(message))).into_response()
}

fn upgrade_error_status(err: &UpgradeError) -> StatusCode {
    match err {
        UpgradeError::AlreadyInProgress | UpgradeError::NotRunning => StatusCode::CONFLICT,
        UpgradeError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn spot_error_status(err: &SpotError) -> StatusCode {
    match err {
        SpotError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        SpotError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        SpotError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn placement_error_status(err: &PlacementError) -> StatusCode {
    match err {
        PlacementError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Shared state for the API
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<UpgradeOrchestrator>,
    pub distributor: Arc<ZoneDistributor>,
    pub hooks: Arc<HookEngine>,
    pub spot: Option<Arc<SpotManager>>,
    /// Provider assumed when an interruption notice names none
    pub spot_provider: String,
    /// Parent of every token handed to background work started by a request
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(
        orchestrator: Arc<UpgradeOrchestrator>,
        distributor: Arc<ZoneDistributor>,
        hooks: Arc<HookEngine>,
    ) -> Self {
        Self {
            orchestrator,
            distributor,
            hooks,
            spot: None,
            spot_provider: String::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_spot(mut self, manager: Arc<SpotManager>, provider: impl Into<String>) -> Self {
        self.spot = Some(manager);
        self.spot_provider = provider.into();
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Create the control plane router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Upgrades
        .route("/v1/upgrade/status", get(upgrade_status))
        .route("/v1/upgrade/plan", get(upgrade_plan).post(create_upgrade_plan))
        .route("/v1/upgrade/execute", post(execute_upgrade))
        .route("/v1/upgrade/pause", post(pause_upgrade))
        .route("/v1/upgrade/resume", post(resume_upgrade))
        .route("/v1/upgrade/stop", post(stop_upgrade))
        // Placement
        .route("/v1/placement/distribute", post(distribute))
        .route("/v1/placement/rebalance", post(rebalance))
        // Spot
        .route("/v1/spot/interruptions", post(spot_interruption))
        // Hooks
        .route("/v1/hooks", get(list_hooks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Upgrade Endpoints
// ============================================================================

async fn upgrade_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

async fn upgrade_plan(State(state): State<ApiState>) -> Response {
    match state.orchestrator.current_plan() {
        Some(plan) => (StatusCode::OK, Json(plan)).into_response(),
        None => failure(StatusCode::NOT_FOUND, "No upgrade has been planned"),
    }
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub from: String,
    pub to: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

async fn create_upgrade_plan(
    State(state): State<ApiState>,
    Json(req): Json<PlanRequest>,
) -> Response {
    if let Some(name) = &req.strategy {
        if let Err(e) = state.orchestrator.set_strategy(name) {
            return failure(upgrade_error_status(&e), e.to_string());
        }
    }
    match state.orchestrator.plan(&req.from, &req.to, &req.nodes) {
        Ok(plan) => {
            info!("Planned upgrade {} via API", plan.id);
            (StatusCode::OK, Json(plan)).into_response()
        }
        Err(e) => failure(upgrade_error_status(&e), e.to_string()),
    }
}

/// Start the current plan in the background; progress shows up in status
async fn execute_upgrade(State(state): State<ApiState>) -> Response {
    let Some(plan) = state.orchestrator.current_plan() else {
        return failure(StatusCode::NOT_FOUND, "No upgrade has been planned");
    };
    let plan_id = plan.id;

    match state.orchestrator.start(plan, state.shutdown.child_token()) {
        Ok(handle) => {
            info!("Upgrade {} started via API", plan_id);
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(status)) => info!(
                        "Upgrade {} finished: {} node(s)",
                        plan_id,
                        status.completed_nodes.len()
                    ),
                    Ok(Err(e)) => warn!("Upgrade {} ended: {}", plan_id, e),
                    Err(e) => warn!("Upgrade {} task aborted: {}", plan_id, e),
                }
            });
            (
                StatusCode::ACCEPTED,
                Json(OperationStatus::success(format!("Upgrade {} started", plan_id))),
            )
                .into_response()
        }
        Err(e) => failure(upgrade_error_status(&e), e.to_string()),
    }
}

fn control_response(result: Result<(), UpgradeError>, done: &str) -> Response {
    match result {
        Ok(()) => {
            info!("{} via API", done);
            (StatusCode::OK, Json(OperationStatus::success(done))).into_response()
        }
        Err(e) => failure(upgrade_error_status(&e), e.to_string()),
    }
}

async fn pause_upgrade(State(state): State<ApiState>) -> Response {
    control_response(state.orchestrator.pause(), "Pause requested")
}

async fn resume_upgrade(State(state): State<ApiState>) -> Response {
    control_response(state.orchestrator.resume(), "Resume requested")
}

async fn stop_upgrade(State(state): State<ApiState>) -> Response {
    control_response(state.orchestrator.stop(), "Stop requested")
}

// ============================================================================
// Placement Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DistributeRequest {
    pub units: u32,
    pub zones: Vec<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

async fn distribute(
    State(state): State<ApiState>,
    Json(req): Json<DistributeRequest>,
) -> Response {
    let result = match &req.strategy {
        Some(name) => state.distributor.distribute_with(name, req.units, &req.zones),
        None => state.distributor.distribute(req.units, &req.zones),
    };
    match result {
        Ok(plan) => (StatusCode::OK, Json(plan)).into_response(),
        Err(e) => failure(placement_error_status(&e), e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct RebalanceRequest {
    pub current: BTreeMap<String, u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebalanceResponse {
    pub deltas: BTreeMap<String, i64>,
    pub moves: Vec<ZoneMove>,
}

async fn rebalance(
    State(state): State<ApiState>,
    Json(req): Json<RebalanceRequest>,
) -> Response {
    if req.current.is_empty() {
        return failure(StatusCode::BAD_REQUEST, PlacementError::NoZones.to_string());
    }
    let deltas = state.distributor.rebalance(&req.current);
    let moves = plan_moves(&deltas);
    (StatusCode::OK, Json(RebalanceResponse { deltas, moves })).into_response()
}

// ============================================================================
// Spot Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionRequest {
    pub node_id: String,
    #[serde(default)]
    pub provider: Option<String>,
}

async fn spot_interruption(
    State(state): State<ApiState>,
    Json(req): Json<InterruptionRequest>,
) -> Response {
    let Some(manager) = state.spot.as_ref() else {
        return failure(StatusCode::NOT_FOUND, "Spot capacity is not configured");
    };
    let provider = req.provider.as_deref().unwrap_or(&state.spot_provider);

    match manager
        .handle_interruption(provider, &req.node_id, &state.shutdown.child_token())
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(OperationStatus::success(format!(
                "Handled interruption of {}",
                req.node_id
            ))),
        )
            .into_response(),
        Err(e) => failure(spot_error_status(&e), e.to_string()),
    }
}

// ============================================================================
// Hooks
// ============================================================================

async fn list_hooks(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.hooks.list())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookAction, Notifier};
    use crate::events::EventType;
    use crate::upgrade::{
        CollaboratorError, HealthChecker, NodeDrainer, NodeUpgrader, UpgradeConfig,
        UpgradeContext, UpgradePhase, UpgradePlan, UpgradeStatus,
    };
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Idle;

    #[async_trait]
    impl NodeDrainer for Idle {
        async fn cordon(&self, _node: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn drain(&self, _node: &str, _timeout: Duration) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn uncordon(&self, _node: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HealthChecker for Idle {
        async fn is_node_healthy(&self, _node: &str) -> Result<bool, CollaboratorError> {
            Ok(true)
        }
    }

    #[async_trait]
    impl NodeUpgrader for Idle {
        async fn upgrade_node(&self, _node: &str, _version: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    /// Upgrades never finish on their own
    struct Stuck;

    #[async_trait]
    impl NodeUpgrader for Stuck {
        async fn upgrade_node(&self, _node: &str, _version: &str) -> Result<(), CollaboratorError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_state() -> ApiState {
        state_with_upgrader(Arc::new(Idle))
    }

    fn state_with_upgrader(upgrader: Arc<dyn NodeUpgrader>) -> ApiState {
        let idle = Arc::new(Idle);
        let orchestrator = UpgradeOrchestrator::new(
            UpgradeConfig::default(),
            UpgradeContext::new(idle.clone(), idle, upgrader),
            Notifier::default(),
        );
        ApiState::new(
            Arc::new(orchestrator),
            Arc::new(ZoneDistributor::new()),
            Arc::new(HookEngine::new()),
        )
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, _) = send(create_router(test_state()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upgrade_status_idle() {
        let (status, body) = send(create_router(test_state()), get("/v1/upgrade/status")).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: UpgradeStatus = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.phase, UpgradePhase::Idle);
    }

    #[tokio::test]
    async fn test_upgrade_plan_missing_then_present() {
        let state = test_state();
        let (status, body) = send(create_router(state.clone()), get("/v1/upgrade/plan")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let nodes = vec!["n1".to_string(), "n2".to_string()];
        state.orchestrator.plan("1.28", "1.29", &nodes).unwrap();

        let (status, body) = send(create_router(state), get("/v1/upgrade/plan")).await;
        assert_eq!(status, StatusCode::OK);
        let plan: UpgradePlan = serde_json::from_value(body).unwrap();
        assert_eq!(plan.target_version, "1.29");
        assert_eq!(plan.nodes.len(), 2);
    }

    async fn wait_for_phase(state: &ApiState, phase: UpgradePhase) {
        for _ in 0..200 {
            if state.orchestrator.status().phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "upgrade never reached {:?}, still {:?}",
            phase,
            state.orchestrator.status().phase
        );
    }

    #[tokio::test]
    async fn test_plan_then_execute_runs_to_completion() {
        let state = test_state();
        let (status, body) = send(
            create_router(state.clone()),
            post_json(
                "/v1/upgrade/plan",
                serde_json::json!({"from": "1.28", "to": "1.29", "nodes": ["n1", "n2", "n3"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let plan: UpgradePlan = serde_json::from_value(body).unwrap();
        assert_eq!(plan.nodes.len(), 3);

        let (status, body) = send(
            create_router(state.clone()),
            post_json("/v1/upgrade/execute", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);

        wait_for_phase(&state, UpgradePhase::Completed).await;
        assert_eq!(state.orchestrator.status().completed_nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_plan_with_unknown_strategy() {
        let (status, body) = send(
            create_router(test_state()),
            post_json(
                "/v1/upgrade/plan",
                serde_json::json!({"from": "1", "to": "2", "nodes": ["n1"], "strategy": "yolo"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("yolo"));
    }

    #[tokio::test]
    async fn test_execute_without_plan() {
        let (status, body) = send(
            create_router(test_state()),
            post_json("/v1/upgrade/execute", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_second_execute_conflicts_and_shutdown_stops() {
        let state = state_with_upgrader(Arc::new(Stuck));
        let nodes = vec!["n1".to_string()];
        state.orchestrator.plan("1.28", "1.29", &nodes).unwrap();

        let execute = || post_json("/v1/upgrade/execute", serde_json::json!({}));
        let (status, _) = send(create_router(state.clone()), execute()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.orchestrator.is_running());

        let (status, body) = send(create_router(state.clone()), execute()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        state.shutdown.cancel();
        wait_for_phase(&state, UpgradePhase::Stopped).await;
        for _ in 0..200 {
            if !state.orchestrator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!state.orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_spot_interruption() {
        let interruption = |body: serde_json::Value| post_json("/v1/spot/interruptions", body);

        let (status, _) = send(
            create_router(test_state()),
            interruption(serde_json::json!({"nodeId": "i-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let manager = Arc::new(SpotManager::default());
        manager.register_provider(Arc::new(crate::cli::local::LocalSpotProvider));
        let state = test_state().with_spot(manager, "local");

        let (status, body) = send(
            create_router(state.clone()),
            interruption(serde_json::json!({"nodeId": "i-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = send(
            create_router(state.clone()),
            interruption(serde_json::json!({"nodeId": "i-1", "provider": "gcp"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.shutdown.cancel();
        let (status, _) = send(
            create_router(state),
            interruption(serde_json::json!({"nodeId": "i-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_control_without_upgrade_is_conflict() {
        for uri in ["/v1/upgrade/pause", "/v1/upgrade/resume", "/v1/upgrade/stop"] {
            let (status, body) = send(
                create_router(test_state()),
                post_json(uri, serde_json::json!({})),
            )
            .await;
            assert_eq!(status, StatusCode::CONFLICT, "{}", uri);
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test]
    async fn test_distribute_round_robin() {
        let (status, body) = send(
            create_router(test_state()),
            post_json(
                "/v1/placement/distribute",
                serde_json::json!({"units": 10, "zones": ["z1", "z2", "z3"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalUnits"], 10);
        assert_eq!(body["zoneCounts"]["z1"], 4);
        assert_eq!(body["zoneCounts"]["z2"], 3);
        assert_eq!(body["zoneCounts"]["z3"], 3);
    }

    #[tokio::test]
    async fn test_distribute_errors() {
        let (status, _) = send(
            create_router(test_state()),
            post_json(
                "/v1/placement/distribute",
                serde_json::json!({"units": 3, "zones": []}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            create_router(test_state()),
            post_json(
                "/v1/placement/distribute",
                serde_json::json!({"units": 3, "zones": ["a"], "strategy": "zigzag"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("zigzag"));
    }

    #[tokio::test]
    async fn test_rebalance() {
        let (status, body) = send(
            create_router(test_state()),
            post_json(
                "/v1/placement/rebalance",
                serde_json::json!({"current": {"a": 6, "b": 0, "c": 0}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let parsed: RebalanceResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.deltas.values().sum::<i64>(), 0);
        assert_eq!(parsed.deltas["a"], -4);
        assert_eq!(parsed.moves.iter().map(|m| m.count).sum::<u32>(), 4);
    }

    #[tokio::test]
    async fn test_list_hooks() {
        let state = test_state();
        state
            .hooks
            .register(EventType::PreUpgrade, HookAction::script("echo hi"), 5)
            .unwrap();

        let (status, body) = send(create_router(state), get("/v1/hooks")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["event"], "pre_upgrade");
        assert_eq!(body[0]["priority"], 5);
    }
}
