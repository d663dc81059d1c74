//! Spot capacity management
//!
//! Requests discounted, interruptible capacity from pluggable
//! [`SpotProvider`]s. A request that cannot be served (no capacity, price
//! over the ceiling) comes back as a typed [`SpotRejection`] whose
//! [`SpotRejection::should_fallback`] tells the caller whether to retry with
//! on-demand capacity.
//!
//! Every provider call races a [`CancellationToken`].

pub mod provisioner;
pub mod strategy;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventType;
use crate::hooks::Notifier;
use crate::registry::{Named, RegistryError, StrategyRegistry};

pub use provisioner::{SpotAwareProvisioner, SpotInventory};
pub use strategy::SpotStrategy;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    PriceTooHigh { price: f64, max_price: f64 },
    CapacityUnavailable { instance_type: String, zone: String },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceTooHigh { price, max_price } => {
                write!(f, "spot price {:.4} exceeds maximum {:.4}", price, max_price)
            }
            Self::CapacityUnavailable {
                instance_type,
                zone,
            } => write!(f, "no spot capacity for {} in {}", instance_type, zone),
        }
    }
}

/// A spot request the provider side could not serve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotRejection {
    pub reason: RejectionReason,
    fallback_on_demand: bool,
}

impl SpotRejection {
    pub fn new(reason: RejectionReason, fallback_on_demand: bool) -> Self {
        Self {
            reason,
            fallback_on_demand,
        }
    }

    /// Whether the caller should retry with on-demand capacity
    pub fn should_fallback(&self) -> bool {
        self.fallback_on_demand
    }
}

impl std::fmt::Display for SpotRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpotError {
    #[error("Spot capacity is disabled")]
    Disabled,

    #[error("Spot request rejected: {0}")]
    Rejected(SpotRejection),

    #[error("No spot price available for {0} in any candidate zone")]
    NoPriceAvailable(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Spot request cancelled")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SpotError {
    /// The rejection, if this error is one
    pub fn rejection(&self) -> Option<&SpotRejection> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

// ============================================================================
// Data
// ============================================================================

/// Node shape to request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: String,
    pub instance_type: String,
    /// Fixed zone; chosen by price when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_type: instance_type.into(),
            ..Default::default()
        }
    }

    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}

/// What is sent to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotRequest {
    pub node_spec: NodeSpec,
    pub zone: String,
    pub max_price_per_hour: f64,
    pub fallback_allowed: bool,
}

/// A created spot instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotOutcome {
    pub instance_ref: String,
    pub zone: String,
    pub actual_price: f64,
}

/// Spot configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Provider used for scale-ups
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Instance type requested for spot nodes
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// Hourly price ceiling (0 = none)
    #[serde(default)]
    pub max_spot_price: f64,

    /// Tell callers to fall back to on-demand on rejection
    #[serde(default = "default_fallback")]
    pub fallback_on_demand: bool,

    /// Zones priced when the node spec has no zone
    #[serde(default)]
    pub candidate_zones: Vec<String>,

    /// Share of a mixed fleet placed on spot capacity
    #[serde(default = "default_spot_percentage")]
    pub spot_percentage: u32,
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            instance_type: default_instance_type(),
            max_spot_price: 0.0,
            fallback_on_demand: default_fallback(),
            candidate_zones: Vec::new(),
            spot_percentage: default_spot_percentage(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}

fn default_instance_type() -> String {
    "m5.large".to_string()
}

fn default_fallback() -> bool {
    true
}

fn default_spot_percentage() -> u32 {
    70
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Cloud-specific spot capacity adapter
#[async_trait]
pub trait SpotProvider: Named + Send + Sync {
    async fn create_spot_instance(&self, request: &SpotRequest) -> Result<SpotOutcome, SpotError>;

    /// Current hourly price
    async fn spot_price(&self, instance_type: &str, zone: &str) -> Result<f64, SpotError>;

    async fn is_spot_available(&self, instance_type: &str, zone: &str) -> Result<bool, SpotError>;

    async fn terminate_instance(&self, node_id: &str) -> Result<(), SpotError>;
}

/// Reacts to a spot interruption notice (drain, backup, reschedule)
#[async_trait]
pub trait InterruptionHandler: Send + Sync {
    async fn on_interruption(&self, provider: &str, node_id: &str) -> Result<(), SpotError>;
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SpotError>>,
) -> Result<T, SpotError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SpotError::Cancelled),
        result = fut => result,
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct SpotManager {
    providers: StrategyRegistry<dyn SpotProvider>,
    handlers: RwLock<Vec<Arc<dyn InterruptionHandler>>>,
    notifier: Notifier,
}

impl SpotManager {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            providers: StrategyRegistry::new(),
            handlers: RwLock::new(Vec::new()),
            notifier,
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn SpotProvider>) {
        info!("Registered spot provider '{}'", provider.name());
        self.providers.register(provider);
    }

    pub fn register_interruption_handler(&self, handler: Arc<dyn InterruptionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.list()
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains(name)
    }

    /// Request one spot instance
    pub async fn create_spot_instance(
        &self,
        provider_name: &str,
        spec: &NodeSpec,
        config: &SpotConfig,
        cancel: &CancellationToken,
    ) -> Result<SpotOutcome, SpotError> {
        if !config.enabled {
            return Err(SpotError::Disabled);
        }
        let provider = self.providers.get(provider_name)?;

        let (zone, known_price) = match &spec.zone {
            Some(zone) => (zone.clone(), None),
            None => {
                let (zone, price) = self
                    .cheapest_zone(provider.as_ref(), &spec.instance_type, config, cancel)
                    .await?;
                (zone, Some(price))
            }
        };

        let available = cancellable(
            cancel,
            provider.is_spot_available(&spec.instance_type, &zone),
        )
        .await?;
        if !available {
            return Err(self.reject(
                RejectionReason::CapacityUnavailable {
                    instance_type: spec.instance_type.clone(),
                    zone,
                },
                config,
            ));
        }

        let price = match known_price {
            Some(p) => p,
            None => cancellable(cancel, provider.spot_price(&spec.instance_type, &zone)).await?,
        };
        if !SpotStrategy::within_budget(price, config.max_spot_price) {
            return Err(self.reject(
                RejectionReason::PriceTooHigh {
                    price,
                    max_price: config.max_spot_price,
                },
                config,
            ));
        }

        let request = SpotRequest {
            node_spec: spec.clone(),
            zone: zone.clone(),
            max_price_per_hour: config.max_spot_price,
            fallback_allowed: config.fallback_on_demand,
        };
        let outcome = cancellable(cancel, provider.create_spot_instance(&request)).await?;

        info!(
            "Created spot instance {} ({}) in {} at {:.4}/h",
            outcome.instance_ref, spec.instance_type, outcome.zone, outcome.actual_price
        );
        self.notifier
            .notify(
                EventType::SpotInstanceCreated,
                json!({
                    "provider": provider_name,
                    "node": spec.name,
                    "instanceRef": outcome.instance_ref,
                    "zone": outcome.zone,
                    "price": outcome.actual_price,
                }),
            )
            .await;

        Ok(outcome)
    }

    /// Price every candidate zone and pick the cheapest
    async fn cheapest_zone(
        &self,
        provider: &dyn SpotProvider,
        instance_type: &str,
        config: &SpotConfig,
        cancel: &CancellationToken,
    ) -> Result<(String, f64), SpotError> {
        let mut prices = BTreeMap::new();
        for zone in &config.candidate_zones {
            match cancellable(cancel, provider.spot_price(instance_type, zone)).await {
                Ok(price) => {
                    prices.insert(zone.clone(), price);
                }
                Err(SpotError::Cancelled) => return Err(SpotError::Cancelled),
                Err(e) => debug!("Skipping zone {} for {}: {}", zone, instance_type, e),
            }
        }

        SpotStrategy::select_best_zone(&prices)
            .ok_or_else(|| SpotError::NoPriceAvailable(instance_type.to_string()))
    }

    fn reject(&self, reason: RejectionReason, config: &SpotConfig) -> SpotError {
        let rejection = SpotRejection::new(reason, config.fallback_on_demand);
        warn!(
            "Spot request rejected: {} (fallback: {})",
            rejection,
            rejection.should_fallback()
        );
        self.notifier.announce(
            EventType::SpotRequestRejected,
            json!({
                "reason": rejection.reason,
                "fallbackOnDemand": rejection.should_fallback(),
            }),
        );
        SpotError::Rejected(rejection)
    }

    /// Terminate one spot instance
    pub async fn terminate_instance(
        &self,
        provider_name: &str,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SpotError> {
        let provider = self.providers.get(provider_name)?;
        cancellable(cancel, provider.terminate_instance(node_id)).await?;
        info!("Terminated spot instance {} on '{}'", node_id, provider_name);
        Ok(())
    }

    /// React to an interruption notice, then terminate the instance
    ///
    /// Handler failures are logged and do not block termination.
    /// Cancellation stops the sequence wherever it is.
    pub async fn handle_interruption(
        &self,
        provider_name: &str,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SpotError> {
        if !self.providers.contains(provider_name) {
            return Err(RegistryError::NotFound(provider_name.to_string()).into());
        }

        warn!("Spot interruption for {} on '{}'", node_id, provider_name);
        self.notifier
            .notify(
                EventType::SpotInterrupted,
                json!({ "provider": provider_name, "node": node_id }),
            )
            .await;

        let handlers: Vec<Arc<dyn InterruptionHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            match cancellable(cancel, handler.on_interruption(provider_name, node_id)).await {
                Ok(()) => {}
                Err(SpotError::Cancelled) => return Err(SpotError::Cancelled),
                Err(e) => warn!("Interruption handler failed for {}: {}", node_id, e),
            }
        }

        self.terminate_instance(provider_name, node_id, cancel).await
    }
}

impl Default for SpotManager {
    fn default() -> Self {
        Self::new(Notifier::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeProvider {
        prices: HashMap<String, f64>,
        available: bool,
        terminated: Mutex<Vec<String>>,
        requests: Mutex<Vec<SpotRequest>>,
        stuck_terminations: bool,
    }

    impl FakeProvider {
        fn new(prices: &[(&str, f64)], available: bool) -> Self {
            Self {
                prices: prices.iter().map(|(z, p)| (z.to_string(), *p)).collect(),
                available,
                terminated: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                stuck_terminations: false,
            }
        }
    }

    impl Named for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
    }

    #[async_trait]
    impl SpotProvider for FakeProvider {
        async fn create_spot_instance(
            &self,
            request: &SpotRequest,
        ) -> Result<SpotOutcome, SpotError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(SpotOutcome {
                instance_ref: format!("i-{}", request.node_spec.name),
                zone: request.zone.clone(),
                actual_price: self.prices.get(&request.zone).copied().unwrap_or(0.0),
            })
        }

        async fn spot_price(&self, _instance_type: &str, zone: &str) -> Result<f64, SpotError> {
            self.prices
                .get(zone)
                .copied()
                .ok_or_else(|| SpotError::Provider(format!("no price for {}", zone)))
        }

        async fn is_spot_available(
            &self,
            _instance_type: &str,
            _zone: &str,
        ) -> Result<bool, SpotError> {
            Ok(self.available)
        }

        async fn terminate_instance(&self, node_id: &str) -> Result<(), SpotError> {
            if self.stuck_terminations {
                std::future::pending::<()>().await;
            }
            self.terminated.lock().unwrap().push(node_id.to_string());
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl InterruptionHandler for FailingHandler {
        async fn on_interruption(&self, _provider: &str, _node_id: &str) -> Result<(), SpotError> {
            Err(SpotError::Provider("backup failed".into()))
        }
    }

    fn enabled(max_price: f64, fallback: bool) -> SpotConfig {
        SpotConfig {
            enabled: true,
            max_spot_price: max_price,
            fallback_on_demand: fallback,
            candidate_zones: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        }
    }

    fn manager(provider: Arc<FakeProvider>) -> SpotManager {
        let m = SpotManager::default();
        m.register_provider(provider);
        m
    }

    #[tokio::test]
    async fn test_price_too_high_rejection_carries_fallback() {
        for fallback in [true, false] {
            let provider = Arc::new(FakeProvider::new(&[("a", 0.50)], true));
            let m = manager(provider.clone());
            let spec = NodeSpec::new("w1", "m5.large").in_zone("a");

            let err = m
                .create_spot_instance("fake", &spec, &enabled(0.10, fallback), &CancellationToken::new())
                .await
                .unwrap_err();

            let rejection = err.rejection().expect("expected a rejection");
            assert!(matches!(
                rejection.reason,
                RejectionReason::PriceTooHigh { .. }
            ));
            assert_eq!(rejection.should_fallback(), fallback);
            assert!(provider.requests.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_capacity_unavailable() {
        let provider = Arc::new(FakeProvider::new(&[("a", 0.05)], false));
        let m = manager(provider);
        let spec = NodeSpec::new("w1", "m5.large").in_zone("a");

        let err = m
            .create_spot_instance("fake", &spec, &enabled(1.0, true), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.rejection().map(|r| &r.reason),
            Some(RejectionReason::CapacityUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_picks_cheapest_zone_and_skips_failed_lookups() {
        // zone c has no price and is skipped
        let provider = Arc::new(FakeProvider::new(&[("a", 0.09), ("b", 0.04)], true));
        let m = manager(provider.clone());
        let spec = NodeSpec::new("w2", "c5.xlarge");

        let outcome = m
            .create_spot_instance("fake", &spec, &enabled(0.0, true), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.zone, "b");
        assert_eq!(outcome.instance_ref, "i-w2");

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].zone, "b");
        assert!(requests[0].fallback_allowed);
    }

    #[tokio::test]
    async fn test_no_prices_anywhere() {
        let provider = Arc::new(FakeProvider::new(&[], true));
        let m = manager(provider);
        let err = m
            .create_spot_instance(
                "fake",
                &NodeSpec::new("w", "t3.micro"),
                &enabled(0.0, true),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SpotError::NoPriceAvailable("t3.micro".into()));
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_provider() {
        let m = SpotManager::default();
        let spec = NodeSpec::new("w", "t3.micro");
        let cancel = CancellationToken::new();

        let err = m
            .create_spot_instance("fake", &spec, &SpotConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, SpotError::Disabled);

        let err = m
            .create_spot_instance("fake", &spec, &enabled(0.0, true), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SpotError::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let provider = Arc::new(FakeProvider::new(&[("a", 0.01)], true));
        let m = manager(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = m
            .create_spot_instance(
                "fake",
                &NodeSpec::new("w", "t3.micro").in_zone("a"),
                &enabled(0.0, true),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, SpotError::Cancelled);
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interruption_terminates_despite_handler_failure() {
        let provider = Arc::new(FakeProvider::new(&[], true));
        let m = manager(provider.clone());
        m.register_interruption_handler(Arc::new(FailingHandler));

        m.handle_interruption("fake", "i-123", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*provider.terminated.lock().unwrap(), vec!["i-123"]);
    }

    #[tokio::test]
    async fn test_interruption_cancelled_during_termination() {
        let provider = Arc::new(FakeProvider {
            stuck_terminations: true,
            ..FakeProvider::new(&[], true)
        });
        let m = manager(provider.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            m.handle_interruption("fake", "i-9", &cancel),
        )
        .await
        .expect("termination was not abandoned");
        assert_eq!(result, Err(SpotError::Cancelled));
        assert!(provider.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interruption_unknown_provider() {
        let m = SpotManager::default();
        let err = m
            .handle_interruption("nope", "i-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpotError::Registry(RegistryError::NotFound(_))));
    }
}
