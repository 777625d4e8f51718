#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsdesk_agent::alerting::{Alert, AlertError, AlertSink, Alerter};
use opsdesk_agent::enhancer::ContextEnhancer;
use opsdesk_agent::llm::{Planner, PlannerError, PlannerRequest, PlannerResponse, StopReason};
use opsdesk_agent::metrics::MetricsRecorder;
use opsdesk_agent::tools::{FixedCatalog, ToolCatalog, ToolDescriptor, ToolError, ToolHandler};
use opsdesk_agent::{ChannelError, HostChannel, RequestPipeline};
use opsdesk_core::domain::{ContentBlock, MessageContent};
use opsdesk_core::settings::{RuntimeSettings, SnapshotStore};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Result<PlannerResponse, PlannerError>>>,
    repeat: Option<PlannerResponse>,
    pub requests: Mutex<Vec<PlannerRequest>>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Result<PlannerResponse, PlannerError>>) -> Self {
        Self { script: Mutex::new(script.into()), repeat: None, requests: Mutex::new(Vec::new()) }
    }

    /// Returns the same response forever.
    pub fn repeating(response: PlannerResponse) -> Self {
        Self { script: Mutex::new(VecDeque::new()), repeat: Some(response), requests: Mutex::new(Vec::new()) }
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlannerRequest) -> Result<PlannerResponse, PlannerError> {
        self.requests.lock().await.push(request.clone());
        if let Some(response) = &self.repeat {
            return Ok(response.clone());
        }
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Decode("script exhausted".to_string())))
    }
}

pub fn text_response(text: &str) -> PlannerResponse {
    PlannerResponse { stop_reason: StopReason::EndTurn, content: vec![ContentBlock::text(text)] }
}

pub fn tool_calls(calls: &[(&str, &str, Value)]) -> PlannerResponse {
    PlannerResponse {
        stop_reason: StopReason::ToolUse,
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
    }
}

/// `(tool_use_id, content, is_error)` of every tool result in a planner request.
pub fn tool_results(request: &PlannerRequest) -> Vec<(String, String, bool)> {
    request
        .messages
        .iter()
        .filter_map(|message| match &message.content {
            MessageContent::Blocks(blocks) => Some(blocks),
            MessageContent::Text(_) => None,
        })
        .flatten()
        .filter_map(|block| match block {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                Some((tool_use_id.clone(), content.clone(), *is_error))
            }
            _ => None,
        })
        .collect()
}

pub enum Behaviour {
    Reply(Value),
    Fail(ToolError),
    Delay(Duration, Value),
}

pub struct RecordingHandler {
    behaviour: Behaviour,
    pub invocations: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self { behaviour, invocations: Mutex::new(Vec::new()) })
    }

    pub async fn count(&self) -> usize {
        self.invocations.lock().await.len()
    }
}

#[async_trait]
impl ToolHandler for RecordingHandler {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        self.invocations.lock().await.push(arguments);
        match &self.behaviour {
            Behaviour::Reply(payload) => Ok(payload.clone()),
            Behaviour::Fail(error) => Err(error.clone()),
            Behaviour::Delay(delay, payload) => {
                tokio::time::sleep(*delay).await;
                Ok(payload.clone())
            }
        }
    }
}

/// Tracks how many invocations overlap.
pub struct GaugeHandler {
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl GaugeHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl ToolHandler for GaugeHandler {
    async fn invoke(&self, _arguments: Value) -> Result<Value, ToolError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

pub fn descriptor(name: &str, handler: Arc<RecordingHandler>) -> ToolDescriptor {
    ToolDescriptor::new(name, format!("{name} test tool"), json!({ "type": "object" }), handler)
        .expect("schema should compile")
}

pub fn catalog(descriptors: Vec<ToolDescriptor>) -> Arc<ToolCatalog> {
    let mut catalog = ToolCatalog::new("chat");
    for descriptor in descriptors {
        catalog.register(descriptor).expect("tool should register");
    }
    Arc::new(catalog)
}

#[derive(Default)]
pub struct RecordingChannel {
    pub acknowledgements: Mutex<Vec<String>>,
    pub replies: Mutex<Vec<String>>,
}

#[async_trait]
impl HostChannel for RecordingChannel {
    async fn acknowledge(&self, text: &str) -> Result<(), ChannelError> {
        self.acknowledgements.lock().await.push(text.to_string());
        Ok(())
    }

    async fn reply(&self, text: &str) -> Result<(), ChannelError> {
        self.replies.lock().await.push(text.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlertSink {
    pub alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

pub fn test_settings() -> RuntimeSettings {
    let mut settings = RuntimeSettings::default();
    settings.planner.retry_base_ms = 0;
    settings.planner.retry_max_ms = 0;
    settings.timeouts.tool_ms = 200;
    settings
}

pub struct Harness {
    pub pipeline: RequestPipeline,
    pub planner: Arc<ScriptedPlanner>,
    pub alerts: Arc<RecordingAlertSink>,
    pub metrics: Arc<MetricsRecorder>,
}

pub fn harness(
    settings: RuntimeSettings,
    planner: ScriptedPlanner,
    catalog: Arc<ToolCatalog>,
) -> Harness {
    let planner = Arc::new(planner);
    let alerts = Arc::new(RecordingAlertSink::default());
    let metrics = Arc::new(MetricsRecorder::new(settings.rollup_interval));
    let pipeline = RequestPipeline::new(
        Arc::new(SnapshotStore::fixed(settings)),
        ContextEnhancer::rules_only(),
        planner.clone(),
        Arc::new(FixedCatalog(catalog)),
        metrics.clone(),
        Alerter::new(alerts.clone()),
    );
    Harness { pipeline, planner, alerts, metrics }
}
