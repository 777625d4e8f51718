use std::sync::Arc;
use std::time::Duration;

use opsdesk_core::domain::{ToolCall, ToolResult};
use opsdesk_core::errors::FailureKind;
use serde_json::Value;
use tracing::{debug, warn};

use crate::guardrails::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};
use crate::tools::{ToolCatalog, ToolError};

const DEFAULT_FALLBACK: &str = "Try a narrower query, a shorter time range, or a different tool.";

/// Why a dispatch did not produce a successful result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchFailure {
    pub tool: String,
    pub kind: FailureKind,
    pub message: String,
    pub alert: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub result: ToolResult,
    pub failure: Option<DispatchFailure>,
}

impl Dispatch {
    fn ok(result: ToolResult) -> Self {
        Self { result, failure: None }
    }

    fn failed(result: ToolResult, tool: &str, kind: FailureKind, alert: bool) -> Self {
        let message = result.error.clone().unwrap_or_default();
        Self { result, failure: Some(DispatchFailure { tool: tool.to_string(), kind, message, alert }) }
    }
}

/// Executes single tool calls against a catalog. Never fails: every outcome is a `ToolResult`.
#[derive(Clone)]
pub struct Dispatcher {
    catalog: Arc<ToolCatalog>,
    guardrails: GuardrailPolicy,
    default_timeout: Duration,
    char_limit: usize,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        guardrails: GuardrailPolicy,
        default_timeout: Duration,
        char_limit: usize,
    ) -> Self {
        Self { catalog, guardrails, default_timeout, char_limit }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub async fn dispatch(&self, call: &ToolCall) -> Dispatch {
        let Some(descriptor) = self.catalog.get(&call.name) else {
            let result = ToolResult::failure(
                call.id.clone(),
                format!(
                    "Unknown tool `{}`. Available tools: {}",
                    call.name,
                    self.catalog.names().join(", ")
                ),
            );
            return Dispatch::failed(result, &call.name, FailureKind::ToolValidation, false);
        };

        if let Err(error) = descriptor.validate(&call.arguments) {
            let result = ToolResult::failure(
                call.id.clone(),
                format!("Invalid arguments for `{}`: {error}", call.name),
            )
            .with_fallback("Check the argument names and types against the tool schema.");
            return Dispatch::failed(result, &call.name, FailureKind::ToolValidation, false);
        }

        let decision = self.guardrails.evaluate(&GuardrailIntent {
            tool: &call.name,
            write_access: descriptor.write_access,
            arguments: &call.arguments,
        });
        if let GuardrailDecision::Deny { reason_code, user_message, fallback_path } = decision {
            warn!(
                event_name = "agent.dispatch.denied",
                tool = %call.name,
                call_id = %call.id,
                reason_code,
                "tool call refused by guardrail"
            );
            let result = ToolResult::failure(call.id.clone(), user_message)
                .with_fallback(fallback_path.replace('_', " "));
            return Dispatch::failed(result, &call.name, FailureKind::ToolExecution, false);
        }

        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);
        let fallback = descriptor.fallback.clone().unwrap_or_else(|| DEFAULT_FALLBACK.to_string());
        let handler = descriptor.handler();
        let arguments = call.arguments.clone();
        let task = tokio::spawn(async move { handler.invoke(arguments).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(payload))) => {
                debug!(
                    event_name = "agent.dispatch.succeeded",
                    tool = %call.name,
                    call_id = %call.id,
                    "tool call succeeded"
                );
                Dispatch::ok(self.compact(ToolResult::success(call.id.clone(), payload)))
            }
            Ok(Ok(Err(error))) => {
                let alert = error.is_alert_worthy();
                let kind = match error {
                    ToolError::InvalidArguments(_) => FailureKind::ToolValidation,
                    _ => FailureKind::ToolExecution,
                };
                warn!(
                    event_name = "agent.dispatch.failed",
                    tool = %call.name,
                    call_id = %call.id,
                    error = %error,
                    "tool handler returned an error"
                );
                let result = ToolResult::failure(call.id.clone(), error.to_string()).with_fallback(fallback);
                Dispatch::failed(result, &call.name, kind, alert)
            }
            Ok(Err(join_error)) => {
                warn!(
                    event_name = "agent.dispatch.failed",
                    tool = %call.name,
                    call_id = %call.id,
                    panicked = join_error.is_panic(),
                    "tool handler aborted"
                );
                let result = ToolResult::failure(
                    call.id.clone(),
                    format!("Tool `{}` crashed while running", call.name),
                )
                .with_fallback(fallback);
                Dispatch::failed(result, &call.name, FailureKind::ToolExecution, true)
            }
            Err(_) => {
                abort.abort();
                warn!(
                    event_name = "agent.dispatch.timed_out",
                    tool = %call.name,
                    call_id = %call.id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "tool handler timed out"
                );
                let result = ToolResult::failure(
                    call.id.clone(),
                    format!("Tool `{}` timed out after {}ms", call.name, timeout.as_millis()),
                )
                .with_fallback(fallback);
                Dispatch::failed(result, &call.name, FailureKind::ToolExecution, false)
            }
        }
    }

    /// Cuts payloads whose serialized form exceeds the limit and marks them partial.
    fn compact(&self, mut result: ToolResult) -> ToolResult {
        let Some(payload) = result.payload.as_ref() else {
            return result;
        };
        let serialized = match payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        if serialized.chars().count() <= self.char_limit {
            return result;
        }

        let notice = format!("\n[output truncated to {} characters]", self.char_limit);
        let keep = self.char_limit.saturating_sub(notice.chars().count());
        let mut cut = serialized.chars().take(keep).collect::<String>();
        cut.push_str(&notice);
        result.payload = Some(Value::String(cut));
        result.partial = true;
        result
    }
}
