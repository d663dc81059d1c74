//! Hook action executors
//!
//! - Script: local script file or inline shell command
//! - ClusterApi: cluster CLI verbs (`kubectl cordon node-1`)
//! - Webhook: JSON POST to an HTTP endpoint

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use super::{ExecutorKind, HookAction, HookError};
use crate::events::EventType;

pub const ENV_EVENT: &str = "FLEETPLANE_EVENT";
pub const ENV_PAYLOAD: &str = "FLEETPLANE_PAYLOAD";
pub const ENV_TIMESTAMP: &str = "FLEETPLANE_TIMESTAMP";

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// What a hook is being run for
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub event: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl HookInvocation {
    pub fn new(event: EventType, payload: Value) -> Self {
        Self {
            event,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Substitution variables: `$EVENT`, `$TIMESTAMP`, plus every top-level
    /// payload field upper-cased (`{"node": "n1"}` gives `$NODE`)
    pub fn variables(&self) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        if let Value::Object(map) = &self.payload {
            for (k, v) in map {
                vars.insert(k.to_uppercase(), v.clone());
            }
        }
        vars.insert("EVENT".to_string(), Value::String(self.event.to_string()));
        vars.insert(
            "TIMESTAMP".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        vars
    }

    /// Environment exported to script and cluster commands
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_EVENT.to_string(), self.event.to_string()),
            (ENV_PAYLOAD.to_string(), self.payload.to_string()),
            (ENV_TIMESTAMP.to_string(), self.timestamp.to_rfc3339()),
        ]
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

fn cluster_verb_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:kubectl\s+)?(apply|delete|label|annotate|cordon|uncordon|drain|scale|patch|rollout|taint|create)\b",
        )
        .expect("cluster verb pattern is valid")
    })
}

/// True when the command starts with a recognised cluster verb
pub fn is_cluster_command(command: &str) -> bool {
    cluster_verb_regex().is_match(command)
}

/// Pick the executor for an action: explicit kind first, then inference
pub fn resolve_executor_kind(action: &HookAction) -> Result<ExecutorKind, HookError> {
    if let Some(kind) = action.executor {
        return Ok(kind);
    }
    if action.script.is_some() {
        return Ok(ExecutorKind::Script);
    }
    if let Some(command) = &action.command {
        if is_cluster_command(command) {
            return Ok(ExecutorKind::ClusterApi);
        }
    }
    if action.url.is_some() {
        return Ok(ExecutorKind::Webhook);
    }
    // Any other command runs through the shell
    if action.command.is_some() {
        return Ok(ExecutorKind::Script);
    }
    Err(HookError::UnresolvableAction(action.describe()))
}

/// Substitute `$NAME` variables in a string
pub fn substitute_variables(template: &str, variables: &HashMap<String, Value>) -> String {
    // Longest names first so $NODE_POOL is not clobbered by $NODE
    let mut keys: Vec<&String> = variables.keys().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let mut result = template.to_string();
    for key in keys {
        let pattern = format!("${}", key);
        let replacement = match &variables[key] {
            Value::String(s) => s.clone(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        };
        result = result.replace(&pattern, &replacement);
    }
    result
}

/// Split a cluster command into CLI arguments, dropping a leading `kubectl`
pub fn cluster_args(command: &str) -> Vec<String> {
    let mut words: Vec<String> = command.split_whitespace().map(String::from).collect();
    if words.first().map(|w| w == "kubectl").unwrap_or(false) {
        words.remove(0);
    }
    words
}

fn parse_stdout(stdout: &[u8]) -> Option<Value> {
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    if stdout.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(&stdout) {
        Ok(v) => Some(v),
        Err(_) => Some(Value::String(stdout)),
    }
}

// ============================================================================
// SBIO: I/O - executors
// ============================================================================

/// Runs one hook action. Timeouts and retries are applied by the engine.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &HookAction,
        invocation: &HookInvocation,
    ) -> Result<Option<Value>, HookError>;
}

/// Local scripts and inline shell commands
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    shell: String,
}

impl ScriptExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl HookExecutor for ScriptExecutor {
    async fn execute(
        &self,
        action: &HookAction,
        invocation: &HookInvocation,
    ) -> Result<Option<Value>, HookError> {
        let script = action
            .script
            .as_deref()
            .or(action.command.as_deref())
            .ok_or_else(|| HookError::InvalidAction("script executor needs a script".into()))?;

        let vars = invocation.variables();
        let expanded = shellexpand::tilde(script).to_string();

        let mut cmd = if Path::new(&expanded).is_file() {
            Command::new(&expanded)
        } else {
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c").arg(script);
            cmd
        };

        // Child inherits the process environment; hook env and invocation env layer on top
        for (key, value) in &action.env {
            cmd.env(key, substitute_variables(value, &vars));
        }
        cmd.envs(invocation.env());
        cmd.kill_on_drop(true);

        debug!("Running hook script: {}", expanded);

        let output = cmd
            .output()
            .await
            .map_err(|e| HookError::ScriptFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HookError::ScriptFailed(format!(
                "Exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(parse_stdout(&output.stdout))
    }
}

/// Cluster API verbs through the `kubectl` binary
#[derive(Debug, Clone)]
pub struct ClusterApiExecutor {
    binary: String,
    kubeconfig: Option<String>,
}

impl ClusterApiExecutor {
    pub fn new(binary: impl Into<String>, kubeconfig: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig,
        }
    }
}

impl Default for ClusterApiExecutor {
    fn default() -> Self {
        Self::new("kubectl", None)
    }
}

#[async_trait]
impl HookExecutor for ClusterApiExecutor {
    async fn execute(
        &self,
        action: &HookAction,
        invocation: &HookInvocation,
    ) -> Result<Option<Value>, HookError> {
        let command = action
            .command
            .as_deref()
            .ok_or_else(|| HookError::InvalidAction("cluster executor needs a command".into()))?;

        let vars = invocation.variables();
        let args = cluster_args(&substitute_variables(command, &vars));
        if args.is_empty() {
            return Err(HookError::InvalidAction("empty cluster command".into()));
        }

        let mut cmd = Command::new(&self.binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig")
                .arg(shellexpand::tilde(kubeconfig).to_string());
        }
        cmd.args(&args);
        for (key, value) in &action.env {
            cmd.env(key, substitute_variables(value, &vars));
        }
        cmd.envs(invocation.env());
        cmd.kill_on_drop(true);

        debug!("Running cluster command: {} {}", self.binary, args.join(" "));

        let output = cmd
            .output()
            .await
            .map_err(|e| HookError::ClusterCommandFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HookError::ClusterCommandFailed(format!(
                "{} exited with {}: {}",
                args[0],
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(parse_stdout(&output.stdout))
    }
}

/// JSON POST of `{event, timestamp, payload}`
#[derive(Debug, Clone, Default)]
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HookExecutor for WebhookExecutor {
    async fn execute(
        &self,
        action: &HookAction,
        invocation: &HookInvocation,
    ) -> Result<Option<Value>, HookError> {
        let url = action
            .url
            .as_deref()
            .ok_or_else(|| HookError::InvalidAction("webhook executor needs a url".into()))?;

        let vars = invocation.variables();
        let url = substitute_variables(url, &vars);

        let body = json!({
            "event": invocation.event,
            "timestamp": invocation.timestamp.to_rfc3339(),
            "payload": invocation.payload,
        });

        let mut request = self.client.post(&url).json(&body);
        for (key, value) in &action.headers {
            request = request.header(key, substitute_variables(value, &vars));
        }

        let response = request
            .send()
            .await
            .map_err(|e| HookError::WebhookFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HookError::WebhookFailed(format!(
                "HTTP {} from {}",
                response.status().as_u16(),
                url
            )));
        }

        Ok(response.json::<Value>().await.ok())
    }
}
