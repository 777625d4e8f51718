use std::time::Duration;

use async_trait::async_trait;
use opsdesk_core::config::LlmConfig;
use opsdesk_core::domain::{ContentBlock, Message};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model client is not configured: {0}")]
    NotConfigured(String),
}

impl PlannerError {
    /// Rate limits, overload, server errors and transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Decode(_) | Self::NotConfigured(_) => false,
        }
    }
}

/// Tool description in the shape the planner consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannerRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("end_turn") => Self::EndTurn,
            Some("tool_use") => Self::ToolUse,
            Some("max_tokens") => Self::MaxTokens,
            Some("stop_sequence") => Self::StopSequence,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other("unknown".to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannerResponse {
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
}

impl PlannerResponse {
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::as_text).collect::<Vec<_>>().join("")
    }
}

/// Decides the next step of an investigation.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlannerRequest) -> Result<PlannerResponse, PlannerError>;
}

/// Single-prompt completion used for auxiliary work such as context extraction.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, PlannerError>;
}

#[derive(Clone, Debug)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl AnthropicClient {
    pub fn new(
        api_key: SecretString,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlannerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| PlannerError::Transport(error.to_string()))?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        })
    }

    /// Builds the planner client and the auxiliary client from process config.
    pub fn pair_from_config(config: &LlmConfig) -> Result<(Self, Self), PlannerError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PlannerError::NotConfigured("llm.api_key is missing".to_string()))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let planner =
            Self::new(api_key.clone(), config.base_url.clone(), config.planner_model.clone(), timeout)?;
        let auxiliary =
            Self::new(api_key, config.base_url.clone(), config.auxiliary_model.clone(), timeout)?;
        Ok((planner, auxiliary))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, body: Value) -> Result<WireResponse, PlannerError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    PlannerError::Timeout(self.timeout)
                } else {
                    PlannerError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Status { status: status.as_u16(), body: truncate(&body, 500) });
        }

        response.json::<WireResponse>().await.map_err(|error| PlannerError::Decode(error.to_string()))
    }
}

#[async_trait]
impl Planner for AnthropicClient {
    async fn plan(&self, request: &PlannerRequest) -> Result<PlannerResponse, PlannerError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }

        debug!(
            event_name = "agent.planner.request",
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            max_tokens = request.max_tokens,
            "sending planner request"
        );

        let wire = self.send(body).await?;
        Ok(wire.into_response())
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, PlannerError> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let wire = self.send(body).await?;
        Ok(wire.into_response().text())
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl WireResponse {
    fn into_response(self) -> PlannerResponse {
        let content = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                WireBlock::Text { text } => Some(ContentBlock::Text { text }),
                WireBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                WireBlock::Other => None,
            })
            .collect();
        PlannerResponse { stop_reason: StopReason::parse(self.stop_reason.as_deref()), content }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
