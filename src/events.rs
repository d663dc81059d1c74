//! In-process lifecycle event bus
//!
//! Components announce state transitions (scaling decisions, upgrade phases,
//! spot interruptions, hook failures) on the [`EventBus`]. Delivery is
//! fire-and-forget: every matching subscriber is invoked on its own tokio
//! task, with no acknowledgement and no ordering guarantee between
//! subscribers.
//!
//! Subscriptions are stored by id, so [`EventBus::unsubscribe`] detaches the
//! handler itself and not just its bookkeeping record.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

/// Opaque handle returned by [`EventBus::subscribe`]
pub type SubscriptionId = Uuid;

/// Lifecycle event names shared by the event bus and the hook engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PreScaleUp,
    PostScaleUp,
    PreScaleDown,
    PostScaleDown,
    ScalingDecision,
    PreUpgrade,
    PostUpgrade,
    UpgradeStarted,
    WaveCompleted,
    NodeUpgraded,
    NodeUpgradeFailed,
    UpgradePaused,
    UpgradeResumed,
    UpgradeStopped,
    UpgradeFailed,
    UpgradeCompleted,
    UpgradeRolledBack,
    SpotInstanceCreated,
    SpotRequestRejected,
    SpotInterrupted,
    HookFailed,
    BackupComplete,
}

impl EventType {
    pub const ALL: [EventType; 22] = [
        EventType::PreScaleUp,
        EventType::PostScaleUp,
        EventType::PreScaleDown,
        EventType::PostScaleDown,
        EventType::ScalingDecision,
        EventType::PreUpgrade,
        EventType::PostUpgrade,
        EventType::UpgradeStarted,
        EventType::WaveCompleted,
        EventType::NodeUpgraded,
        EventType::NodeUpgradeFailed,
        EventType::UpgradePaused,
        EventType::UpgradeResumed,
        EventType::UpgradeStopped,
        EventType::UpgradeFailed,
        EventType::UpgradeCompleted,
        EventType::UpgradeRolledBack,
        EventType::SpotInstanceCreated,
        EventType::SpotRequestRejected,
        EventType::SpotInterrupted,
        EventType::HookFailed,
        EventType::BackupComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreScaleUp => "pre_scale_up",
            Self::PostScaleUp => "post_scale_up",
            Self::PreScaleDown => "pre_scale_down",
            Self::PostScaleDown => "post_scale_down",
            Self::ScalingDecision => "scaling_decision",
            Self::PreUpgrade => "pre_upgrade",
            Self::PostUpgrade => "post_upgrade",
            Self::UpgradeStarted => "upgrade_started",
            Self::WaveCompleted => "wave_completed",
            Self::NodeUpgraded => "node_upgraded",
            Self::NodeUpgradeFailed => "node_upgrade_failed",
            Self::UpgradePaused => "upgrade_paused",
            Self::UpgradeResumed => "upgrade_resumed",
            Self::UpgradeStopped => "upgrade_stopped",
            Self::UpgradeFailed => "upgrade_failed",
            Self::UpgradeCompleted => "upgrade_completed",
            Self::UpgradeRolledBack => "upgrade_rolled_back",
            Self::SpotInstanceCreated => "spot_instance_created",
            Self::SpotRequestRejected => "spot_request_rejected",
            Self::SpotInterrupted => "spot_interrupted",
            Self::HookFailed => "hook_failed",
            Self::BackupComplete => "backup_complete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// An immutable lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an event stamped with the current time and the local host as source
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            source: default_source().to_string(),
            payload,
        }
    }

    /// Override the event source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Host name of this control plane, resolved once
pub fn default_source() -> &'static str {
    static SOURCE: OnceLock<String> = OnceLock::new();
    SOURCE.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "fleetplane".to_string())
    })
}

/// Receiver of events from the bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    async fn handle(&self, event: Event) {
        (self)(event)
    }
}

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Publish/subscribe hub for lifecycle events
pub struct EventBus {
    subscribers: DashMap<EventType, Vec<Subscriber>>,
    index: DashMap<SubscriptionId, EventType>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Register a handler for one event type
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: impl EventHandler + 'static,
    ) -> SubscriptionId {
        self.subscribe_arc(event_type, Arc::new(handler))
    }

    /// Register a shared handler for one event type
    pub fn subscribe_arc(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers
            .entry(event_type)
            .or_default()
            .push(Subscriber { id, handler });
        self.index.insert(id, event_type);
        debug!("Subscription {} registered for '{}'", id, event_type);
        id
    }

    /// Detach a subscription. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, event_type)) = self.index.remove(&id) else {
            return false;
        };

        if let Some(mut subs) = self.subscribers.get_mut(&event_type) {
            subs.retain(|s| s.id != id);
        }
        debug!("Subscription {} removed from '{}'", id, event_type);
        true
    }

    /// Number of live subscriptions for an event type
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .get(&event_type)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Deliver an event to every subscriber of its type, one task per subscriber
    pub fn emit(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = match self.subscribers.get(&event.event_type) {
            Some(subs) => subs.iter().map(|s| s.handler.clone()).collect(),
            None => return,
        };

        if handlers.is_empty() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(
                    "No async runtime available, dropping '{}' event",
                    event.event_type
                );
                return;
            }
        };

        trace!(
            "Dispatching '{}' to {} subscriber(s)",
            event.event_type,
            handlers.len()
        );

        for handler in handlers {
            let event = event.clone();
            runtime.spawn(async move {
                handler.handle(event).await;
            });
        }
    }

    /// Build and emit an event in one call
    pub fn publish(&self, event_type: EventType, payload: Value) {
        self.emit(Event::new(event_type, payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
