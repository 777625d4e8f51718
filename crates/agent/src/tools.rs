use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use opsdesk_core::settings::{HandlerKind, RuntimeSettings, ServiceEntry, Snapshot, ToolDefinition};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::llm::ToolSchema;

/// Pseudo-tool the planner calls to answer without further investigation.
pub const RESPOND_DIRECTLY: &str = "respond_directly";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    NotFound(String),
    #[error("tool request failed: {0}")]
    Transport(String),
    #[error("tool backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("tool handler failed: {0}")]
    Handler(String),
    #[error("invalid schema for `{tool}`: {message}")]
    Schema { tool: String, message: String },
    #[error("tool `{0}` is registered more than once")]
    Duplicate(String),
}

impl ToolError {
    /// Backend and handler faults page the operators; caller mistakes do not.
    pub fn is_alert_worthy(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Handler(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidArguments(_)
            | Self::NotFound(_)
            | Self::Schema { .. }
            | Self::Duplicate(_) => false,
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError>;
}

pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub write_access: bool,
    pub timeout: Option<Duration>,
    pub fallback: Option<String>,
    validator: JSONSchema,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("write_access", &self.write_access)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self, ToolError> {
        let name = name.into();
        let validator = JSONSchema::compile(&schema)
            .map_err(|error| ToolError::Schema { tool: name.clone(), message: error.to_string() })?;
        Ok(Self {
            name,
            description: description.into(),
            schema,
            write_access: false,
            timeout: None,
            fallback: None,
            validator,
            handler,
        })
    }

    pub fn with_write_access(mut self, write_access: bool) -> Self {
        self.write_access = write_access;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        self.validator.validate(arguments).map_err(|errors| {
            let messages = errors.map(|error| error.to_string()).collect::<Vec<_>>();
            ToolError::InvalidArguments(messages.join("; "))
        })
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    pub fn schema_for_planner(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.schema.clone(),
        }
    }
}

/// Read-only after construction; shared between concurrent loops behind an `Arc`.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    profile: String,
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(profile: impl Into<String>) -> Self {
        Self { profile: profile.into(), tools: BTreeMap::new() }
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), ToolError> {
        if descriptor.name == RESPOND_DIRECTLY || self.tools.contains_key(&descriptor.name) {
            return Err(ToolError::Duplicate(descriptor.name));
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Every registered tool plus the `respond_directly` pseudo-tool.
    pub fn planner_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.values().map(ToolDescriptor::schema_for_planner).collect::<Vec<_>>();
        schemas.push(ToolSchema {
            name: RESPOND_DIRECTLY.to_string(),
            description: "Answer the user directly without calling any other tool. Use for greetings, clarifying questions, or when no investigation is needed.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string", "description": "The reply to send" } },
                "required": ["message"]
            }),
        });
        schemas
    }

    /// Builds the catalog for one profile from the tools declared in the settings.
    pub fn from_settings(
        settings: &RuntimeSettings,
        profile: &str,
        http: &reqwest::Client,
    ) -> Result<Self, ToolError> {
        let mut catalog = Self::new(profile);
        for definition in settings.tools_for_profile(profile) {
            catalog.register(descriptor_from_definition(definition, settings, http)?)?;
        }
        Ok(catalog)
    }
}

fn descriptor_from_definition(
    definition: &ToolDefinition,
    settings: &RuntimeSettings,
    http: &reqwest::Client,
) -> Result<ToolDescriptor, ToolError> {
    let handler: Arc<dyn ToolHandler> = match definition.handler {
        HandlerKind::Http => {
            let endpoint = definition.endpoint.clone().ok_or_else(|| ToolError::Schema {
                tool: definition.name.clone(),
                message: "http handler requires an endpoint".to_string(),
            })?;
            Arc::new(HttpToolHandler::new(http.clone(), endpoint))
        }
        HandlerKind::ServiceInfo => Arc::new(ServiceInfoHandler::new(settings.services.clone())),
    };

    Ok(ToolDescriptor::new(
        definition.name.clone(),
        definition.description.clone(),
        definition.schema.clone(),
        handler,
    )?
    .with_write_access(definition.write_access)
    .with_timeout(definition.timeout_ms.map(Duration::from_millis))
    .with_fallback(definition.fallback.clone()))
}

/// Supplies the catalog a request should use for a given settings snapshot.
pub trait CatalogProvider: Send + Sync {
    fn catalog(&self, snapshot: &Snapshot) -> Arc<ToolCatalog>;
}

/// A catalog that never changes. Used by tests and embedders with hand-built tools.
pub struct FixedCatalog(pub Arc<ToolCatalog>);

impl CatalogProvider for FixedCatalog {
    fn catalog(&self, _snapshot: &Snapshot) -> Arc<ToolCatalog> {
        Arc::clone(&self.0)
    }
}

/// Rebuilds the catalog when the settings snapshot version changes.
pub struct SettingsCatalog {
    profile: String,
    http: reqwest::Client,
    cached: RwLock<Option<(u64, Arc<ToolCatalog>)>>,
}

impl SettingsCatalog {
    pub fn new(profile: impl Into<String>, http: reqwest::Client) -> Self {
        Self { profile: profile.into(), http, cached: RwLock::new(None) }
    }
}

impl CatalogProvider for SettingsCatalog {
    fn catalog(&self, snapshot: &Snapshot) -> Arc<ToolCatalog> {
        {
            let cached = match self.cached.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some((version, catalog)) = cached.as_ref() {
                if *version == snapshot.version {
                    return Arc::clone(catalog);
                }
            }
        }

        let mut cached = match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match ToolCatalog::from_settings(&snapshot.settings, &self.profile, &self.http) {
            Ok(catalog) => {
                info!(
                    event_name = "agent.catalog.built",
                    profile = %self.profile,
                    version = snapshot.version,
                    tools = catalog.len(),
                    "tool catalog built"
                );
                let catalog = Arc::new(catalog);
                *cached = Some((snapshot.version, Arc::clone(&catalog)));
                catalog
            }
            Err(build_error) => {
                error!(
                    event_name = "agent.catalog.build_failed",
                    profile = %self.profile,
                    version = snapshot.version,
                    error = %build_error,
                    "tool catalog build failed; keeping previous catalog"
                );
                match cached.as_mut() {
                    Some((version, catalog)) => {
                        *version = snapshot.version;
                        Arc::clone(catalog)
                    }
                    None => {
                        let empty = Arc::new(ToolCatalog::new(self.profile.clone()));
                        *cached = Some((snapshot.version, Arc::clone(&empty)));
                        empty
                    }
                }
            }
        }
    }
}

/// Posts the validated arguments as JSON to the tool's endpoint.
pub struct HttpToolHandler {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpToolHandler {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self { http, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl ToolHandler for HttpToolHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&arguments)
            .send()
            .await
            .map_err(|error| ToolError::Transport(error.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| ToolError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(ToolError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        Ok(serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body)))
    }
}

/// Answers `get_service_info` from the service registry.
pub struct ServiceInfoHandler {
    services: BTreeMap<String, ServiceEntry>,
}

impl ServiceInfoHandler {
    pub fn new(services: BTreeMap<String, ServiceEntry>) -> Self {
        Self { services }
    }

    fn lookup(&self, query: &str) -> Option<(&String, &ServiceEntry)> {
        let query = query.trim().to_lowercase();
        self.services.iter().find(|(key, entry)| {
            key.to_lowercase() == query
                || entry.aliases.iter().any(|alias| alias.to_lowercase() == query)
        })
    }
}

#[async_trait]
impl ToolHandler for ServiceInfoHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let query = arguments
            .get("service")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("`service` must be a string".to_string()))?;

        let Some((key, entry)) = self.lookup(query) else {
            let known = self.services.keys().take(10).cloned().collect::<Vec<_>>();
            return Err(ToolError::NotFound(format!(
                "Service `{query}` is not in the registry. Known services include: {}",
                known.join(", ")
            )));
        };

        Ok(json!({
            "service": key,
            "aliases": entry.aliases,
            "description": entry.description,
            "owner": entry.owner,
            "repository": entry.repository,
            "log_group": entry.log_group,
            "dashboards": entry.dashboards,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use opsdesk_core::settings::{
        HandlerKind, RuntimeSettings, ServiceEntry, SnapshotStore, ToolDefinition,
    };
    use serde_json::{json, Value};

    use super::{
        CatalogProvider, ServiceInfoHandler, SettingsCatalog, ToolCatalog, ToolDescriptor,
        ToolError, ToolHandler, RESPOND_DIRECTLY,
    };

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
            Ok(arguments)
        }
    }

    fn search_logs() -> ToolDescriptor {
        ToolDescriptor::new(
            "search_logs",
            "Search logs",
            json!({
                "type": "object",
                "properties": { "service": { "type": "string" }, "env": { "type": "string" } },
                "required": ["service"]
            }),
            Arc::new(EchoHandler),
        )
        .expect("schema should compile")
    }

    fn definition(name: &str, profiles: &[&str]) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            schema: json!({ "type": "object" }),
            write_access: false,
            profiles: profiles.iter().map(|profile| profile.to_string()).collect(),
            handler: HandlerKind::ServiceInfo,
            endpoint: None,
            timeout_ms: Some(1500),
            fallback: None,
        }
    }

    #[test]
    fn validation_reports_schema_violations() {
        let tool = search_logs();
        assert!(tool.validate(&json!({ "service": "service-x" })).is_ok());

        let error = tool.validate(&json!({ "env": 3 })).expect_err("missing service should fail");
        let ToolError::InvalidArguments(message) = error else {
            panic!("expected invalid arguments");
        };
        assert!(message.contains("service"));
    }

    #[test]
    fn invalid_schema_is_rejected_at_registration() {
        let result = ToolDescriptor::new(
            "broken",
            "Broken",
            json!({ "type": "not-a-type" }),
            Arc::new(EchoHandler),
        );
        assert!(matches!(result, Err(ToolError::Schema { .. })));
    }

    #[test]
    fn planner_schemas_include_respond_directly_and_reject_shadowing() {
        let mut catalog = ToolCatalog::new("chat");
        catalog.register(search_logs()).expect("first registration");

        let names = catalog.planner_schemas().into_iter().map(|schema| schema.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["search_logs".to_string(), RESPOND_DIRECTLY.to_string()]);

        assert!(matches!(catalog.register(search_logs()), Err(ToolError::Duplicate(_))));
        let shadow = ToolDescriptor::new(RESPOND_DIRECTLY, "x", json!({}), Arc::new(EchoHandler))
            .expect("schema should compile");
        assert!(catalog.register(shadow).is_err());
    }

    #[test]
    fn catalogs_are_built_per_profile() {
        let settings = RuntimeSettings {
            tools: vec![
                definition("get_service_info", &["chat", "ide"]),
                definition("list_alarms", &["chat"]),
                definition("code_search", &["ide"]),
            ],
            ..RuntimeSettings::default()
        };
        let http = reqwest::Client::new();

        let chat = ToolCatalog::from_settings(&settings, "chat", &http).expect("chat catalog");
        let ide = ToolCatalog::from_settings(&settings, "ide", &http).expect("ide catalog");

        assert_eq!(chat.names(), vec!["get_service_info", "list_alarms"]);
        assert_eq!(ide.names(), vec!["code_search", "get_service_info"]);
        assert_eq!(
            ide.get("code_search").and_then(|tool| tool.timeout),
            Some(std::time::Duration::from_millis(1500))
        );
    }

    #[tokio::test]
    async fn settings_catalog_is_cached_per_snapshot_version() {
        let store = SnapshotStore::fixed(RuntimeSettings {
            tools: vec![definition("get_service_info", &["chat"])],
            ..RuntimeSettings::default()
        });
        let provider = SettingsCatalog::new("chat", reqwest::Client::new());

        let snapshot = store.current().await;
        let first = provider.catalog(&snapshot);
        let second = provider.catalog(&snapshot);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn service_info_resolves_aliases() {
        let mut services = BTreeMap::new();
        services.insert(
            "service-x".to_string(),
            ServiceEntry {
                aliases: vec!["svcx".to_string()],
                description: "Checkout backend".to_string(),
                ..ServiceEntry::default()
            },
        );
        let handler = ServiceInfoHandler::new(services);

        let found = handler.invoke(json!({ "service": "SVCX" })).await.expect("alias lookup");
        assert_eq!(found["service"], "service-x");
        assert_eq!(found["description"], "Checkout backend");

        let missing = handler.invoke(json!({ "service": "nope" })).await;
        assert!(matches!(missing, Err(ToolError::NotFound(ref message)) if message.contains("service-x")));
    }
}
