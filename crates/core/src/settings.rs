//! Hot-reloadable runtime settings.
//!
//! Process configuration (`crate::config`) is read once at startup. Everything an
//! operator tunes while the service runs lives here instead: prompt, limits, tool
//! catalog, guardrail lists and the service registry. Readers get an immutable
//! `Arc` snapshot from [`SnapshotStore`]; a stale snapshot is reloaded lazily and
//! a failed reload keeps the previous snapshot in service.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::interpolate_env_vars;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an operations assistant for an engineering \
team. Use the available tools to investigate the request, call several tools in one turn when \
they are independent, and stop as soon as you can answer. Never perform write operations. \
Answer concisely with the evidence you found.";

pub const DEFAULT_ACKNOWLEDGMENT: &str = "On it...";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not read settings file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse settings file `{path}`: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("settings interpolation failed: {0}")]
    Interpolation(String),
    #[error("invalid runtime settings: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub system_prompt: String,
    pub acknowledgment: String,
    pub max_tool_calls: u32,
    pub history_window: usize,
    pub tool_concurrency: usize,
    pub result_char_limit: usize,
    pub rollup_interval: u64,
    pub operations_channel_keywords: Vec<String>,
    pub timeouts: StageTimeouts,
    pub planner: PlannerSettings,
    pub guardrails: GuardrailSettings,
    pub redaction: RedactionSettings,
    pub services: BTreeMap<String, ServiceEntry>,
    pub environments: BTreeMap<String, Vec<String>>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub enhancer_ms: u64,
    pub planner_ms: u64,
    pub tool_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub first_max_tokens: u32,
    pub followup_max_tokens: u32,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailSettings {
    pub denylist: Vec<String>,
    /// Read-only prefixes for the `command` argument. When non-empty, other
    /// commands are refused. An empty list turns the check off.
    pub allowlist: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    pub extra_patterns: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    pub aliases: Vec<String>,
    pub description: String,
    pub owner: Option<String>,
    pub repository: Option<String>,
    pub log_group: Option<String>,
    pub dashboards: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    #[default]
    Http,
    ServiceInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub schema: Value,
    #[serde(default)]
    pub write_access: bool,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub handler: HandlerKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Suggestion handed to the planner when this tool fails.
    #[serde(default)]
    pub fallback: Option<String>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn default_profiles() -> Vec<String> {
    vec!["chat".to_string()]
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            acknowledgment: DEFAULT_ACKNOWLEDGMENT.to_string(),
            max_tool_calls: 5,
            history_window: 10,
            tool_concurrency: 4,
            result_char_limit: 8000,
            rollup_interval: 10,
            operations_channel_keywords: ["devops", "infra", "platform", "sre", "ops", "deploy", "ci-cd"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            timeouts: StageTimeouts::default(),
            planner: PlannerSettings::default(),
            guardrails: GuardrailSettings::default(),
            redaction: RedactionSettings::default(),
            services: BTreeMap::new(),
            environments: default_environments(),
            tools: Vec::new(),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self { enhancer_ms: 3_000, planner_ms: 30_000, tool_ms: 15_000 }
    }
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            first_max_tokens: 600,
            followup_max_tokens: 1200,
            max_retries: 2,
            retry_base_ms: 500,
            retry_max_ms: 5_000,
        }
    }
}

const READ_ONLY_COMMANDS: [&str; 38] = [
    "ec2 describe-instances",
    "ec2 describe-security-groups",
    "ec2 describe-vpcs",
    "ec2 describe-subnets",
    "ec2 describe-nat-gateways",
    "ecs describe-services",
    "ecs describe-clusters",
    "ecs describe-task-definition",
    "ecs list-services",
    "ecs list-tasks",
    "ecs list-clusters",
    "elbv2 describe-load-balancers",
    "elbv2 describe-target-groups",
    "elbv2 describe-listeners",
    "elbv2 describe-rules",
    "wafv2 list-web-acls",
    "wafv2 get-web-acl",
    "wafv2 list-resources-for-web-acl",
    "lambda list-functions",
    "lambda get-function",
    "lambda get-function-configuration",
    "cloudwatch describe-alarms",
    "logs describe-log-groups",
    "iam list-roles",
    "iam get-role",
    "iam list-policies",
    "s3 ls",
    "s3api list-buckets",
    "s3api get-bucket-policy",
    "s3api get-bucket-cors",
    "route53 list-hosted-zones",
    "route53 list-resource-record-sets",
    "secretsmanager list-secrets",
    "rds describe-db-instances",
    "rds describe-db-clusters",
    "cloudformation list-stacks",
    "cloudformation describe-stacks",
    "cloudformation describe-stack-resources",
];

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            denylist: [
                "delete",
                "terminate",
                "remove",
                "update",
                "create",
                "put-",
                "modify",
                "start",
                "stop",
                "reboot",
                "get-secret-value",
                "get-authorization-token",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            allowlist: READ_ONLY_COMMANDS.iter().map(|prefix| prefix.to_string()).collect(),
        }
    }
}

fn default_environments() -> BTreeMap<String, Vec<String>> {
    let mut environments = BTreeMap::new();
    environments.insert(
        "prod".to_string(),
        vec!["production".to_string(), "prd".to_string(), "live".to_string()],
    );
    environments.insert("staging".to_string(), vec!["stage".to_string(), "stg".to_string()]);
    environments.insert("dev".to_string(), vec!["development".to_string(), "sandbox".to_string()]);
    environments
}

impl StageTimeouts {
    pub fn enhancer(&self) -> Duration {
        Duration::from_millis(self.enhancer_ms)
    }

    pub fn planner(&self) -> Duration {
        Duration::from_millis(self.planner_ms)
    }

    pub fn tool(&self) -> Duration {
        Duration::from_millis(self.tool_ms)
    }
}

impl RuntimeSettings {
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, SettingsError> {
        let interpolated = interpolate_env_vars(raw)
            .map_err(|error| SettingsError::Interpolation(error.to_string()))?;
        let settings = toml::from_str::<Self>(&interpolated)
            .map_err(|source| SettingsError::Parse { path: origin.to_path_buf(), source })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.system_prompt.trim().is_empty() {
            return Err(SettingsError::Invalid("system_prompt must not be empty".to_string()));
        }
        if self.max_tool_calls == 0 || self.max_tool_calls > 50 {
            return Err(SettingsError::Invalid("max_tool_calls must be in range 1..=50".to_string()));
        }
        if self.history_window > 200 {
            return Err(SettingsError::Invalid("history_window must be at most 200".to_string()));
        }
        if self.tool_concurrency == 0 {
            return Err(SettingsError::Invalid(
                "tool_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.result_char_limit < 256 {
            return Err(SettingsError::Invalid(
                "result_char_limit must be at least 256".to_string(),
            ));
        }
        if self.rollup_interval == 0 {
            return Err(SettingsError::Invalid(
                "rollup_interval must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.enhancer_ms == 0 || self.timeouts.planner_ms == 0 || self.timeouts.tool_ms == 0
        {
            return Err(SettingsError::Invalid("stage timeouts must be greater than zero".to_string()));
        }
        if self.planner.first_max_tokens == 0 || self.planner.followup_max_tokens == 0 {
            return Err(SettingsError::Invalid("planner token budgets must be positive".to_string()));
        }
        if self.planner.retry_base_ms > self.planner.retry_max_ms {
            return Err(SettingsError::Invalid(
                "planner.retry_base_ms must not exceed planner.retry_max_ms".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for tool in &self.tools {
            validate_tool(tool)?;
            if !seen.insert(tool.name.as_str()) {
                return Err(SettingsError::Invalid(format!("duplicate tool name `{}`", tool.name)));
            }
        }

        Ok(())
    }

    pub fn tools_for_profile<'a>(
        &'a self,
        profile: &'a str,
    ) -> impl Iterator<Item = &'a ToolDefinition> + 'a {
        self.tools.iter().filter(move |tool| tool.profiles.iter().any(|p| p == profile))
    }
}

fn validate_tool(tool: &ToolDefinition) -> Result<(), SettingsError> {
    let name_ok = !tool.name.is_empty()
        && tool.name.len() <= 64
        && tool.name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if !name_ok {
        return Err(SettingsError::Invalid(format!(
            "tool name `{}` must be 1-64 characters of [A-Za-z0-9_-]",
            tool.name
        )));
    }
    if tool.description.trim().is_empty() {
        return Err(SettingsError::Invalid(format!("tool `{}` needs a description", tool.name)));
    }
    if !tool.schema.is_object() {
        return Err(SettingsError::Invalid(format!(
            "tool `{}` schema must be a JSON object",
            tool.name
        )));
    }
    if tool.profiles.is_empty() {
        return Err(SettingsError::Invalid(format!(
            "tool `{}` must belong to at least one profile",
            tool.name
        )));
    }
    if tool.handler == HandlerKind::Http && tool.endpoint.as_deref().map_or(true, str::is_empty) {
        return Err(SettingsError::Invalid(format!(
            "tool `{}` uses the http handler but has no endpoint",
            tool.name
        )));
    }
    if tool.timeout_ms == Some(0) {
        return Err(SettingsError::Invalid(format!(
            "tool `{}` timeout_ms must be greater than zero",
            tool.name
        )));
    }
    Ok(())
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<RuntimeSettings, SettingsError>;

    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn load(&self) -> Result<RuntimeSettings, SettingsError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SettingsError::Read { path: self.path.clone(), source })?;
        RuntimeSettings::from_toml_str(&raw, &self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Serves fixed settings. Used when no settings file is configured.
#[derive(Clone, Debug, Default)]
pub struct StaticSettingsSource {
    settings: RuntimeSettings,
}

impl StaticSettingsSource {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SettingsSource for StaticSettingsSource {
    async fn load(&self) -> Result<RuntimeSettings, SettingsError> {
        self.settings.validate()?;
        Ok(self.settings.clone())
    }

    fn describe(&self) -> String {
        "built-in defaults".to_string()
    }
}

/// One immutable view of the runtime settings. `version` increases on every
/// successful reload so consumers can cache derived state.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub settings: Arc<RuntimeSettings>,
    pub version: u64,
}

struct Cached {
    snapshot: Snapshot,
    checked_at: Instant,
}

pub struct SnapshotStore {
    source: Arc<dyn SettingsSource>,
    ttl: Duration,
    cached: RwLock<Cached>,
}

impl SnapshotStore {
    /// Performs the initial load. Startup fails if the first load fails.
    pub async fn load(source: Arc<dyn SettingsSource>, ttl: Duration) -> Result<Self, SettingsError> {
        let settings = source.load().await?;
        info!(
            event_name = "system.settings.loaded",
            source = %source.describe(),
            tools = settings.tools.len(),
            "runtime settings loaded"
        );
        Ok(Self {
            source,
            ttl,
            cached: RwLock::new(Cached {
                snapshot: Snapshot { settings: Arc::new(settings), version: 1 },
                checked_at: Instant::now(),
            }),
        })
    }

    pub fn fixed(settings: RuntimeSettings) -> Self {
        Self {
            source: Arc::new(StaticSettingsSource::new(settings.clone())),
            ttl: Duration::MAX,
            cached: RwLock::new(Cached {
                snapshot: Snapshot { settings: Arc::new(settings), version: 1 },
                checked_at: Instant::now(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the current snapshot, reloading first when it is older than the TTL.
    pub async fn current(&self) -> Snapshot {
        {
            let cached = self.cached.read().await;
            if cached.checked_at.elapsed() < self.ttl {
                return cached.snapshot.clone();
            }
        }

        let mut cached = self.cached.write().await;
        if cached.checked_at.elapsed() < self.ttl {
            return cached.snapshot.clone();
        }
        self.reload_locked(&mut cached).await;
        cached.snapshot.clone()
    }

    /// Forces a reload regardless of age and reports whether it succeeded.
    pub async fn refresh(&self) -> Result<Snapshot, SettingsError> {
        let mut cached = self.cached.write().await;
        let result = self.source.load().await;
        cached.checked_at = Instant::now();
        match result {
            Ok(settings) => {
                cached.snapshot = Snapshot {
                    settings: Arc::new(settings),
                    version: cached.snapshot.version.saturating_add(1),
                };
                Ok(cached.snapshot.clone())
            }
            Err(error) => {
                warn!(
                    event_name = "system.settings.reload_failed",
                    source = %self.source.describe(),
                    error = %error,
                    "runtime settings reload failed; keeping previous snapshot"
                );
                Err(error)
            }
        }
    }

    async fn reload_locked(&self, cached: &mut Cached) {
        cached.checked_at = Instant::now();
        match self.source.load().await {
            Ok(settings) => {
                cached.snapshot = Snapshot {
                    settings: Arc::new(settings),
                    version: cached.snapshot.version.saturating_add(1),
                };
                info!(
                    event_name = "system.settings.reloaded",
                    version = cached.snapshot.version,
                    "runtime settings reloaded"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "system.settings.reload_failed",
                    source = %self.source.describe(),
                    error = %error,
                    "runtime settings reload failed; keeping previous snapshot"
                );
            }
        }
    }
}
