use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::message::ContentBlock;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolCallId(pub String);

impl std::fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self { id: ToolCallId(id.into()), name: name.into(), arguments }
    }
}

/// Normalized outcome of one tool call. Always tied to the call that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub partial: bool,
}

impl ToolResult {
    pub fn success(call_id: ToolCallId, payload: Value) -> Self {
        Self { call_id, success: true, payload: Some(payload), error: None, fallback: None, partial: false }
    }

    pub fn failure(call_id: ToolCallId, error: impl Into<String>) -> Self {
        Self {
            call_id,
            success: false,
            payload: None,
            error: Some(error.into()),
            fallback: None,
            partial: false,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Render as a `tool_result` block for the next planner turn.
    pub fn to_block(&self) -> ContentBlock {
        let content = if self.success {
            match &self.payload {
                Some(Value::String(text)) => text.clone(),
                Some(payload) => payload.to_string(),
                None => "{}".to_owned(),
            }
        } else {
            let mut body = serde_json::Map::new();
            body.insert(
                "error".to_owned(),
                Value::String(self.error.clone().unwrap_or_else(|| "tool failed".to_owned())),
            );
            if let Some(fallback) = &self.fallback {
                body.insert("suggestion".to_owned(), Value::String(fallback.clone()));
            }
            Value::Object(body).to_string()
        };

        ContentBlock::ToolResult {
            tool_use_id: self.call_id.0.clone(),
            content,
            is_error: !self.success,
        }
    }
}
