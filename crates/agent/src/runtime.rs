//! The orchestration loop.
//!
//! One [`AgentRuntime::run`] call drives a single request through
//! `Planning -> Executing -> Planning ... -> Done | LimitExceeded`. Turns are
//! strictly sequential; the tool calls inside one turn run concurrently and are
//! all collected before the planner sees any of them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use opsdesk_core::domain::{ContentBlock, ConversationState, CorrelationId, Message, Role, ToolCall};
use opsdesk_core::errors::FailureKind;
use opsdesk_core::settings::RuntimeSettings;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{DispatchFailure, Dispatcher};
use crate::llm::{Planner, PlannerError, PlannerRequest, PlannerResponse};
use crate::tools::RESPOND_DIRECTLY;

pub const EMPTY_ANSWER_MESSAGE: &str = "I found some results but had trouble summarizing them.";
pub const LIMIT_MESSAGE: &str = "I wasn't able to finish the investigation within my step limit. Could you ask again with more specific details, such as the service name, environment, or time range?";
pub const DEGRADED_MESSAGE: &str = "I could not complete the investigation because the assistant backend is unavailable right now. Please try again in a few minutes.";
pub const CANCELLED_MESSAGE: &str = "The investigation was cancelled before it finished.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 500, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_tool_calls: u32,
    pub first_max_tokens: u32,
    pub followup_max_tokens: u32,
    pub planner_timeout: Duration,
    pub tool_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

impl LoopConfig {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            max_tool_calls: settings.max_tool_calls,
            first_max_tokens: settings.planner.first_max_tokens,
            followup_max_tokens: settings.planner.followup_max_tokens,
            planner_timeout: settings.timeouts.planner(),
            tool_concurrency: settings.tool_concurrency.max(1),
            retry: RetryPolicy {
                max_retries: settings.planner.max_retries,
                base_delay_ms: settings.planner.retry_base_ms,
                max_delay_ms: settings.planner.retry_max_ms,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoopState {
    Planning,
    Executing(Vec<ToolCall>),
    Done(String),
    LimitExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    LimitExceeded,
    Degraded,
    Cancelled,
}

impl LoopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LimitExceeded => "limit_exceeded",
            Self::Degraded => "degraded",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopOutcome {
    pub final_text: String,
    pub tools_used: Vec<String>,
    pub hit_limit: bool,
    pub truncated: bool,
    pub turns: u32,
    pub status: LoopStatus,
    pub planner_error: Option<String>,
    pub tool_failures: Vec<DispatchFailure>,
}

enum PlanFailure {
    Cancelled,
    Exhausted(PlannerError),
}

pub struct AgentRuntime {
    planner: Arc<dyn Planner>,
}

impl AgentRuntime {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }

    pub async fn run(
        &self,
        system: &str,
        messages: Vec<Message>,
        dispatcher: &Dispatcher,
        config: &LoopConfig,
        cancel: &CancellationToken,
        correlation_id: &CorrelationId,
    ) -> LoopOutcome {
        let tools = dispatcher.catalog().planner_schemas();
        let mut state = ConversationState::new(messages);
        let mut last_text: Option<String> = None;
        let mut truncated = false;
        let mut tool_failures = Vec::new();
        let mut phase = LoopState::Planning;

        loop {
            phase = match phase {
                LoopState::Planning => {
                    if cancel.is_cancelled() {
                        return cancelled(state, truncated, tool_failures);
                    }

                    let request = PlannerRequest {
                        system: system.to_string(),
                        messages: state.messages.clone(),
                        tools: tools.clone(),
                        max_tokens: if state.turn == 0 {
                            config.first_max_tokens
                        } else {
                            config.followup_max_tokens
                        },
                    };

                    let response = match self.plan_with_retry(&request, config, cancel, correlation_id).await {
                        Ok(response) => response,
                        Err(PlanFailure::Cancelled) => {
                            return cancelled(state, truncated, tool_failures);
                        }
                        Err(PlanFailure::Exhausted(error)) => {
                            warn!(
                                event_name = "agent.loop.degraded",
                                correlation_id = %correlation_id,
                                failure_kind = %FailureKind::PlannerCall,
                                turn = state.turn,
                                error = %error,
                                "planner retries exhausted"
                            );
                            return LoopOutcome {
                                final_text: DEGRADED_MESSAGE.to_string(),
                                tools_used: state.tools_used,
                                hit_limit: false,
                                truncated,
                                turns: state.turn,
                                status: LoopStatus::Degraded,
                                planner_error: Some(error.to_string()),
                                tool_failures,
                            };
                        }
                    };

                    let text = response.text();
                    if !text.trim().is_empty() {
                        last_text = Some(text.clone());
                    }
                    next_state(&mut state, response, text, correlation_id)
                }
                LoopState::Executing(calls) => {
                    if state.turn >= config.max_tool_calls {
                        LoopState::LimitExceeded
                    } else {
                        let turn = state.advance_turn();
                        info!(
                            event_name = "agent.loop.turn_started",
                            correlation_id = %correlation_id,
                            turn,
                            tools = ?calls.iter().map(|call| call.name.as_str()).collect::<Vec<_>>(),
                            "executing tool calls"
                        );

                        let semaphore = Arc::new(Semaphore::new(config.tool_concurrency));
                        let pending = calls.iter().map(|call| {
                            let semaphore = Arc::clone(&semaphore);
                            async move {
                                let _permit = semaphore.acquire().await.ok();
                                dispatcher.dispatch(call).await
                            }
                        });

                        let dispatched = tokio::select! {
                            dispatched = join_all(pending) => dispatched,
                            _ = cancel.cancelled() => {
                                return cancelled(state, truncated, tool_failures);
                            }
                        };

                        let mut blocks = Vec::with_capacity(dispatched.len());
                        for (call, dispatch) in calls.iter().zip(dispatched) {
                            state.record_tool(call.name.clone());
                            truncated |= dispatch.result.partial;
                            if let Some(failure) = dispatch.failure {
                                tool_failures.push(failure);
                            }
                            blocks.push(dispatch.result.to_block());
                        }
                        state.push(Message::blocks(Role::User, blocks));
                        LoopState::Planning
                    }
                }
                LoopState::Done(text) => {
                    let final_text = if text.trim().is_empty() {
                        EMPTY_ANSWER_MESSAGE.to_string()
                    } else {
                        text
                    };
                    info!(
                        event_name = "agent.loop.completed",
                        correlation_id = %correlation_id,
                        turns = state.turn,
                        tools_used = state.tools_used.len(),
                        "investigation completed"
                    );
                    return LoopOutcome {
                        final_text,
                        tools_used: state.tools_used,
                        hit_limit: false,
                        truncated,
                        turns: state.turn,
                        status: LoopStatus::Completed,
                        planner_error: None,
                        tool_failures,
                    };
                }
                LoopState::LimitExceeded => {
                    warn!(
                        event_name = "agent.loop.limit_exceeded",
                        correlation_id = %correlation_id,
                        failure_kind = %FailureKind::LimitExceeded,
                        max_tool_calls = config.max_tool_calls,
                        "tool call limit reached"
                    );
                    return LoopOutcome {
                        final_text: last_text.unwrap_or_else(|| LIMIT_MESSAGE.to_string()),
                        tools_used: state.tools_used,
                        hit_limit: true,
                        truncated,
                        turns: state.turn,
                        status: LoopStatus::LimitExceeded,
                        planner_error: None,
                        tool_failures,
                    };
                }
            };
        }
    }

    async fn plan_with_retry(
        &self,
        request: &PlannerRequest,
        config: &LoopConfig,
        cancel: &CancellationToken,
        correlation_id: &CorrelationId,
    ) -> Result<PlannerResponse, PlanFailure> {
        let mut attempt = 0;
        loop {
            let call = tokio::time::timeout(config.planner_timeout, self.planner.plan(request));
            let result = tokio::select! {
                result = call => result,
                _ = cancel.cancelled() => return Err(PlanFailure::Cancelled),
            };
            let error = match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => error,
                Err(_) => PlannerError::Timeout(config.planner_timeout),
            };

            if !error.is_retryable() || attempt >= config.retry.max_retries {
                return Err(PlanFailure::Exhausted(error));
            }

            warn!(
                event_name = "agent.planner.retry",
                correlation_id = %correlation_id,
                attempt,
                max_retries = config.retry.max_retries,
                error = %error,
                "planner call failed; retrying"
            );
            let delay = config.retry.backoff(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PlanFailure::Cancelled),
                }
            }
            attempt += 1;
        }
    }
}

/// Classifies a planner response. Tool calls are executed only when tool-use
/// blocks are present; `respond_directly` short-circuits to a final answer.
/// Repeated tool-use ids keep their first block only, so each result pairs
/// with exactly one call.
fn next_state(
    state: &mut ConversationState,
    response: PlannerResponse,
    text: String,
    correlation_id: &CorrelationId,
) -> LoopState {
    let mut seen = HashSet::new();
    let received = response.content.len();
    let content = response
        .content
        .into_iter()
        .filter(|block| match block {
            ContentBlock::ToolUse { id, .. } => seen.insert(id.clone()),
            _ => true,
        })
        .collect::<Vec<_>>();
    if content.len() < received {
        warn!(
            event_name = "agent.loop.duplicate_tool_call",
            correlation_id = %correlation_id,
            dropped = received - content.len(),
            "planner repeated a tool call id; keeping the first"
        );
    }

    let calls = content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some(ToolCall::new(id.clone(), name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect::<Vec<_>>();

    if let Some(direct) = calls.iter().find(|call| call.name == RESPOND_DIRECTLY) {
        let message = direct
            .arguments
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(text);
        return LoopState::Done(message);
    }

    if calls.is_empty() {
        return LoopState::Done(text);
    }

    state.push(Message::blocks(Role::Assistant, content));
    LoopState::Executing(calls)
}

fn cancelled(
    state: ConversationState,
    truncated: bool,
    tool_failures: Vec<DispatchFailure>,
) -> LoopOutcome {
    info!(event_name = "agent.loop.cancelled", turns = state.turn, "investigation cancelled");
    LoopOutcome {
        final_text: CANCELLED_MESSAGE.to_string(),
        tools_used: state.tools_used,
        hit_limit: false,
        truncated,
        turns: state.turn,
        status: LoopStatus::Cancelled,
        planner_error: None,
        tool_failures,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use opsdesk_core::domain::{ContentBlock, CorrelationId, Message, MessageContent};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::{AgentRuntime, LoopConfig, LoopStatus, RetryPolicy, DEGRADED_MESSAGE, EMPTY_ANSWER_MESSAGE};
    use crate::dispatcher::Dispatcher;
    use crate::guardrails::GuardrailPolicy;
    use crate::llm::{Planner, PlannerError, PlannerRequest, PlannerResponse, StopReason};
    use crate::tools::{ToolCatalog, ToolDescriptor, ToolError, ToolHandler};

    #[derive(Default)]
    struct ScriptedPlanner {
        script: Mutex<VecDeque<Result<PlannerResponse, PlannerError>>>,
        requests: Mutex<Vec<PlannerRequest>>,
    }

    impl ScriptedPlanner {
        fn new(script: Vec<Result<PlannerResponse, PlannerError>>) -> Self {
            Self { script: Mutex::new(script.into()), requests: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, request: &PlannerRequest) -> Result<PlannerResponse, PlannerError> {
            self.requests.lock().await.push(request.clone());
            self.script.lock().await.pop_front().unwrap_or_else(|| Ok(final_text("")))
        }
    }

    struct CountingHandler;

    #[async_trait]
    impl ToolHandler for CountingHandler {
        async fn invoke(&self, _arguments: Value) -> Result<Value, ToolError> {
            Ok(json!({ "entries": 1 }))
        }
    }

    fn final_text(text: &str) -> PlannerResponse {
        PlannerResponse { stop_reason: StopReason::EndTurn, content: vec![ContentBlock::text(text)] }
    }

    fn tool_use(id: &str, name: &str) -> PlannerResponse {
        PlannerResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![ContentBlock::ToolUse { id: id.to_string(), name: name.to_string(), input: json!({}) }],
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut catalog = ToolCatalog::new("chat");
        catalog
            .register(
                ToolDescriptor::new("list_alarms", "List alarms", json!({ "type": "object" }), Arc::new(CountingHandler))
                    .expect("schema"),
            )
            .expect("register");
        Dispatcher::new(Arc::new(catalog), GuardrailPolicy::default(), Duration::from_secs(1), 8_000)
    }

    fn config() -> LoopConfig {
        LoopConfig {
            retry: RetryPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 },
            ..LoopConfig::default()
        }
    }

    async fn run(planner: Arc<ScriptedPlanner>, config: &LoopConfig) -> super::LoopOutcome {
        AgentRuntime::new(planner)
            .run(
                "system",
                vec![Message::user("any alarms?")],
                &dispatcher(),
                config,
                &CancellationToken::new(),
                &CorrelationId("req-test".to_string()),
            )
            .await
    }

    #[tokio::test]
    async fn token_budget_grows_after_the_first_call() {
        let planner = Arc::new(ScriptedPlanner::new(vec![
            Ok(tool_use("t1", "list_alarms")),
            Ok(final_text("No alarms firing.")),
        ]));

        let outcome = run(planner.clone(), &config()).await;

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.final_text, "No alarms firing.");
        let requests = planner.requests.lock().await;
        assert_eq!(requests[0].max_tokens, 600);
        assert_eq!(requests[1].max_tokens, 1200);
        assert_eq!(requests[1].messages.len(), 3);
        assert!(matches!(&requests[1].messages[2].content, MessageContent::Blocks(blocks)
            if matches!(&blocks[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "t1")));
    }

    #[tokio::test]
    async fn respond_directly_ends_the_loop_with_its_message() {
        let planner = Arc::new(ScriptedPlanner::new(vec![Ok(PlannerResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![ContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "respond_directly".to_string(),
                input: json!({ "message": "Hi! What should I look into?" }),
            }],
        })]));

        let outcome = run(planner, &config()).await;

        assert_eq!(outcome.final_text, "Hi! What should I look into?");
        assert!(outcome.tools_used.is_empty());
        assert_eq!(outcome.turns, 0);
    }

    #[tokio::test]
    async fn tool_use_signal_without_blocks_is_treated_as_final_text() {
        let planner = Arc::new(ScriptedPlanner::new(vec![Ok(PlannerResponse {
            stop_reason: StopReason::ToolUse,
            content: vec![ContentBlock::text("Nothing to run.")],
        })]));

        let outcome = run(planner, &config()).await;
        assert_eq!(outcome.final_text, "Nothing to run.");
        assert_eq!(outcome.status, LoopStatus::Completed);
    }

    #[tokio::test]
    async fn empty_final_text_is_replaced() {
        let planner = Arc::new(ScriptedPlanner::new(vec![Ok(final_text("  "))]));
        let outcome = run(planner, &config()).await;
        assert_eq!(outcome.final_text, EMPTY_ANSWER_MESSAGE);
    }

    #[tokio::test]
    async fn limit_returns_last_planner_text_as_partial_answer() {
        let mut thinking = tool_use("t1", "list_alarms");
        thinking.content.insert(0, ContentBlock::text("Two alarms so far."));
        let planner = Arc::new(ScriptedPlanner::new(vec![
            Ok(thinking),
            Ok(tool_use("t2", "list_alarms")),
        ]));
        let config = LoopConfig { max_tool_calls: 1, ..config() };

        let outcome = run(planner, &config).await;

        assert!(outcome.hit_limit);
        assert_eq!(outcome.status, LoopStatus::LimitExceeded);
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.final_text, "Two alarms so far.");
    }

    #[tokio::test]
    async fn retryable_planner_errors_are_retried() {
        let planner = Arc::new(ScriptedPlanner::new(vec![
            Err(PlannerError::Status { status: 529, body: "overloaded".to_string() }),
            Ok(final_text("Recovered.")),
        ]));

        let outcome = run(planner.clone(), &config()).await;

        assert_eq!(outcome.final_text, "Recovered.");
        assert_eq!(planner.requests.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_planner_error_degrades_immediately() {
        let planner = Arc::new(ScriptedPlanner::new(vec![Err(PlannerError::Status {
            status: 400,
            body: "bad request".to_string(),
        })]));

        let outcome = run(planner.clone(), &config()).await;

        assert_eq!(outcome.status, LoopStatus::Degraded);
        assert_eq!(outcome.final_text, DEGRADED_MESSAGE);
        assert!(outcome.planner_error.is_some());
        assert_eq!(planner.requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn repeated_tool_call_ids_get_one_result() {
        let mut repeated = tool_use("t1", "list_alarms");
        repeated.content.push(ContentBlock::ToolUse {
            id: "t1".to_string(),
            name: "list_alarms".to_string(),
            input: json!({}),
        });
        let planner = Arc::new(ScriptedPlanner::new(vec![Ok(repeated), Ok(final_text("One alarm."))]));

        let outcome = run(planner.clone(), &config()).await;

        assert_eq!(outcome.tools_used, vec!["list_alarms".to_string()]);
        let requests = planner.requests.lock().await;
        let count_blocks = |index: usize| match &requests[1].messages[index].content {
            MessageContent::Blocks(blocks) => blocks.len(),
            MessageContent::Text(_) => 0,
        };
        assert_eq!(count_blocks(1), 1);
        assert_eq!(count_blocks(2), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 100, max_delay_ms: 350 };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
    }
}
