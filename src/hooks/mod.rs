//! Lifecycle hook engine
//!
//! Hooks are user actions bound to lifecycle events (`pre_upgrade`,
//! `post_scale_up`, ...). When an event fires, its hooks run sequentially in
//! ascending priority (ties in registration order). Each attempt is bounded
//! by the hook's timeout and retried with linear backoff. A failing hook is
//! logged and announced as `hook_failed`; it never stops the remaining hooks
//! or the operation that triggered them.

pub mod executors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, EventType};

pub use executors::{
    resolve_executor_kind, ClusterApiExecutor, HookExecutor, HookInvocation, ScriptExecutor,
    WebhookExecutor,
};

/// Default per-attempt timeout
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// Default number of attempts
pub const DEFAULT_RETRY_COUNT: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HookError {
    #[error("Cannot determine executor for action: {0}")]
    UnresolvableAction(String),

    #[error("Invalid hook action: {0}")]
    InvalidAction(String),

    #[error("No executor registered for {0}")]
    NoExecutor(ExecutorKind),

    #[error("Script failed: {0}")]
    ScriptFailed(String),

    #[error("Cluster command failed: {0}")]
    ClusterCommandFailed(String),

    #[error("Webhook failed: {0}")]
    WebhookFailed(String),

    #[error("Timeout after {0}s")]
    Timeout(u64),
}

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Script,
    ClusterApi,
    Webhook,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Script => "script",
            Self::ClusterApi => "cluster-api",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

/// What a hook does when it fires
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookAction {
    /// Explicit executor; inferred from the other fields when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,

    /// Script path (tilde-expanded) or inline shell command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Cluster command, e.g. `kubectl cordon $NODE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl HookAction {
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            ..Default::default()
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn webhook(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Short human description for logs and errors
    pub fn describe(&self) -> String {
        if let Some(s) = &self.script {
            format!("script '{}'", s)
        } else if let Some(c) = &self.command {
            format!("command '{}'", c)
        } else if let Some(u) = &self.url {
            format!("webhook '{}'", u)
        } else {
            "empty action".to_string()
        }
    }
}

/// A hook bound to one lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRegistration {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub event: EventType,

    pub action: HookAction,

    /// Lower runs first
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Total attempts (minimum 1)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl HookRegistration {
    pub fn new(event: EventType, action: HookAction, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            event,
            action,
            priority,
            timeout_seconds: DEFAULT_HOOK_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry_count = attempts;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

/// One hook that did not succeed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookFailure {
    pub hook_id: Uuid,
    pub error: String,
}

/// Outcome of [`HookEngine::trigger_hooks`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookReport {
    pub event: EventType,
    pub succeeded: Vec<Uuid>,
    pub failures: Vec<HookFailure>,
}

impl HookReport {
    fn new(event: EventType) -> Self {
        Self {
            event,
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }
}

/// Hook engine configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    /// Linear backoff unit between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Shell used for inline scripts
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Cluster CLI binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    #[serde(default)]
    pub registrations: Vec<HookRegistration>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            shell: default_shell(),
            kubectl: default_kubectl(),
            kubeconfig: None,
            registrations: Vec::new(),
        }
    }
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

// ============================================================================
// Engine
// ============================================================================

pub struct HookEngine {
    hooks: DashMap<EventType, Vec<HookRegistration>>,
    executors: HashMap<ExecutorKind, Arc<dyn HookExecutor>>,
    backoff_unit: Duration,
    events: Option<Arc<EventBus>>,
}

impl HookEngine {
    /// Engine with the default script, cluster and webhook executors
    pub fn new() -> Self {
        let mut executors: HashMap<ExecutorKind, Arc<dyn HookExecutor>> = HashMap::new();
        executors.insert(ExecutorKind::Script, Arc::new(ScriptExecutor::default()));
        executors.insert(
            ExecutorKind::ClusterApi,
            Arc::new(ClusterApiExecutor::default()),
        );
        executors.insert(ExecutorKind::Webhook, Arc::new(WebhookExecutor::new()));

        Self {
            hooks: DashMap::new(),
            executors,
            backoff_unit: Duration::from_millis(default_backoff_ms()),
            events: None,
        }
    }

    /// Build an engine from configuration and register the configured hooks
    pub fn from_config(config: &HooksConfig) -> Result<Self, HookError> {
        let engine = Self::new()
            .with_executor(
                ExecutorKind::Script,
                Arc::new(ScriptExecutor::new(config.shell.clone())),
            )
            .with_executor(
                ExecutorKind::ClusterApi,
                Arc::new(ClusterApiExecutor::new(
                    config.kubectl.clone(),
                    config.kubeconfig.clone(),
                )),
            )
            .with_backoff(Duration::from_millis(config.backoff_ms));

        for registration in &config.registrations {
            engine.register_hook(registration.clone())?;
        }
        Ok(engine)
    }

    /// Replace the executor for one kind
    pub fn with_executor(mut self, kind: ExecutorKind, executor: Arc<dyn HookExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn with_backoff(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Announce hook failures on this bus
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register an action for an event with default timeout and retries
    pub fn register(
        &self,
        event: EventType,
        action: HookAction,
        priority: i32,
    ) -> Result<Uuid, HookError> {
        self.register_hook(HookRegistration::new(event, action, priority))
    }

    /// Register a fully specified hook
    ///
    /// Fails when no executor can be resolved for the action.
    pub fn register_hook(&self, registration: HookRegistration) -> Result<Uuid, HookError> {
        resolve_executor_kind(&registration.action)?;

        let id = registration.id;
        debug!(
            "Registering hook {} on {} (priority {})",
            registration.label(),
            registration.event,
            registration.priority
        );

        let mut list = self.hooks.entry(registration.event).or_default();
        // Insert after every hook with priority <= ours to keep ties in registration order
        let pos = list
            .iter()
            .position(|h| h.priority > registration.priority)
            .unwrap_or(list.len());
        list.insert(pos, registration);

        Ok(id)
    }

    /// Remove a hook by id
    pub fn unregister(&self, id: Uuid) -> bool {
        let mut removed = false;
        for mut entry in self.hooks.iter_mut() {
            let before = entry.len();
            entry.retain(|h| h.id != id);
            if entry.len() != before {
                removed = true;
            }
        }
        removed
    }

    /// Hooks for one event in execution order
    pub fn hooks_for(&self, event: EventType) -> Vec<HookRegistration> {
        self.hooks
            .get(&event)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Every registered hook, grouped by event in a stable order
    pub fn list(&self) -> Vec<HookRegistration> {
        EventType::ALL
            .iter()
            .flat_map(|event| self.hooks_for(*event))
            .collect()
    }

    /// Run every hook registered for `event`
    pub async fn trigger_hooks(&self, event: EventType, payload: Value) -> HookReport {
        let hooks = self.hooks_for(event);
        let mut report = HookReport::new(event);
        if hooks.is_empty() {
            return report;
        }

        info!("Triggering {} hook(s) for {}", hooks.len(), event);
        let invocation = HookInvocation::new(event, payload);

        for hook in hooks {
            match self.run_hook(&hook, &invocation).await {
                Ok(_) => {
                    debug!("Hook {} on {} completed", hook.label(), event);
                    report.succeeded.push(hook.id);
                }
                Err(e) => {
                    warn!("Hook {} on {} failed: {}", hook.label(), event, e);
                    if let Some(bus) = &self.events {
                        bus.publish(
                            EventType::HookFailed,
                            json!({
                                "hookId": hook.id,
                                "event": event,
                                "error": e.to_string(),
                            }),
                        );
                    }
                    report.failures.push(HookFailure {
                        hook_id: hook.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// One hook with per-attempt timeout and linear backoff
    async fn run_hook(
        &self,
        hook: &HookRegistration,
        invocation: &HookInvocation,
    ) -> Result<Option<Value>, HookError> {
        let kind = resolve_executor_kind(&hook.action)?;
        let executor = self
            .executors
            .get(&kind)
            .cloned()
            .ok_or(HookError::NoExecutor(kind))?;

        let timeout_secs = if hook.timeout_seconds == 0 {
            DEFAULT_HOOK_TIMEOUT_SECS
        } else {
            hook.timeout_seconds
        };
        let attempts = hook.retry_count.max(1);
        let mut last_error = HookError::Timeout(timeout_secs);

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                executor.execute(&hook.action, invocation),
            )
            .await;

            match result {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = HookError::Timeout(timeout_secs),
            }

            if attempt < attempts {
                debug!(
                    "Hook {} attempt {}/{} failed: {}",
                    hook.label(),
                    attempt,
                    attempts,
                    last_error
                );
                tokio::time::sleep(self.backoff_unit * attempt).await;
            }
        }

        Err(last_error)
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Runs hooks and announces the same event on the bus
///
/// Shared by every service that wraps mutating operations with lifecycle
/// hooks.
#[derive(Clone)]
pub struct Notifier {
    hooks: Option<Arc<HookEngine>>,
    events: Arc<EventBus>,
}

impl Notifier {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            hooks: None,
            events,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn hooks(&self) -> Option<&Arc<HookEngine>> {
        self.hooks.as_ref()
    }

    /// Trigger hooks for `event`, then publish it
    pub async fn notify(&self, event: EventType, payload: Value) -> Option<HookReport> {
        let report = match &self.hooks {
            Some(hooks) => Some(hooks.trigger_hooks(event, payload.clone()).await),
            None => None,
        };
        self.events.publish(event, payload);
        report
    }

    /// Publish without running hooks
    pub fn announce(&self, event: EventType, payload: Value) {
        self.events.publish(event, payload);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}
