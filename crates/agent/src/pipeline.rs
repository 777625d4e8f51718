use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use opsdesk_core::domain::{CorrelationId, RequestMetrics};
use opsdesk_core::errors::FailureKind;
use opsdesk_core::settings::SnapshotStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerting::Alerter;
use crate::conversation::{build_messages, ChannelContext, HistoryEntry};
use crate::dispatcher::Dispatcher;
use crate::enhancer::ContextEnhancer;
use crate::format::{MarkupConverter, Redactor, ResponseFormatter};
use crate::guardrails::GuardrailPolicy;
use crate::llm::Planner;
use crate::metrics::MetricsSink;
use crate::runtime::{AgentRuntime, LoopConfig, LoopStatus};
use crate::tools::CatalogProvider;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRequest {
    pub text: String,
    pub history: Vec<HistoryEntry>,
    pub channel: ChannelContext,
    pub correlation_id: CorrelationId,
    pub thread_id: Option<String>,
}

impl InboundRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
            channel: ChannelContext::default(),
            correlation_id: CorrelationId::generate(),
            thread_id: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("host channel delivery failed: {0}")]
    Delivery(String),
}

/// Where the request came from. Acknowledgment goes out before planning starts,
/// the formatted reply after the loop ends.
#[async_trait]
pub trait HostChannel: Send + Sync {
    async fn acknowledge(&self, text: &str) -> Result<(), ChannelError>;
    async fn reply(&self, text: &str) -> Result<(), ChannelError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineReply {
    pub text: String,
    pub tools_used: Vec<String>,
    pub hit_limit: bool,
    pub status: LoopStatus,
    pub metrics: RequestMetrics,
}

pub struct RequestPipeline {
    settings: Arc<SnapshotStore>,
    enhancer: ContextEnhancer,
    runtime: AgentRuntime,
    catalogs: Arc<dyn CatalogProvider>,
    metrics: Arc<dyn MetricsSink>,
    alerter: Alerter,
    formatter: ResponseFormatter,
}

impl RequestPipeline {
    pub fn new(
        settings: Arc<SnapshotStore>,
        enhancer: ContextEnhancer,
        planner: Arc<dyn Planner>,
        catalogs: Arc<dyn CatalogProvider>,
        metrics: Arc<dyn MetricsSink>,
        alerter: Alerter,
    ) -> Self {
        Self {
            settings,
            enhancer,
            runtime: AgentRuntime::new(planner),
            catalogs,
            metrics,
            alerter,
            formatter: ResponseFormatter,
        }
    }

    pub fn settings(&self) -> &Arc<SnapshotStore> {
        &self.settings
    }

    /// Acknowledge, run, reply. Channel failures are logged and never abort the request.
    pub async fn handle(
        &self,
        request: &InboundRequest,
        channel: &dyn HostChannel,
        converter: &dyn MarkupConverter,
        cancel: &CancellationToken,
    ) -> PipelineReply {
        let acknowledgment = self.settings.current().await.settings.acknowledgment.clone();
        if let Err(error) = channel.acknowledge(&acknowledgment).await {
            warn!(
                event_name = "agent.pipeline.ack_failed",
                correlation_id = %request.correlation_id,
                thread_id = request.thread_id.as_deref().unwrap_or("unknown"),
                error = %error,
                "failed to send acknowledgment"
            );
        }

        let reply = self.process(request, converter, cancel).await;

        if reply.status != LoopStatus::Cancelled {
            if let Err(error) = channel.reply(&reply.text).await {
                warn!(
                    event_name = "agent.pipeline.reply_failed",
                    correlation_id = %request.correlation_id,
                    thread_id = request.thread_id.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "failed to deliver reply"
                );
            }
        }
        reply
    }

    pub async fn process(
        &self,
        request: &InboundRequest,
        converter: &dyn MarkupConverter,
        cancel: &CancellationToken,
    ) -> PipelineReply {
        let started = Instant::now();
        let correlation_id = request.correlation_id.as_str();
        let thread_id = request.thread_id.as_deref();
        let snapshot = self.settings.current().await;
        let settings = &snapshot.settings;

        info!(
            event_name = "agent.pipeline.started",
            correlation_id,
            thread_id = thread_id.unwrap_or("unknown"),
            settings_version = snapshot.version,
            "processing request"
        );

        let enhancement =
            self.enhancer.enhance(&request.text, settings, Local::now().naive_local()).await;
        let messages = build_messages(
            &request.history,
            &enhancement.text,
            &request.channel,
            settings.history_window,
        );

        let dispatcher = Dispatcher::new(
            self.catalogs.catalog(&snapshot),
            GuardrailPolicy::from_settings(&settings.guardrails),
            settings.timeouts.tool(),
            settings.result_char_limit,
        );
        let config = LoopConfig::from_settings(settings);
        let outcome = self
            .runtime
            .run(
                &settings.system_prompt,
                messages,
                &dispatcher,
                &config,
                cancel,
                &request.correlation_id,
            )
            .await;

        let formatted = self.formatter.format(
            &outcome.final_text,
            converter,
            &settings.redaction.extra_patterns,
            correlation_id,
        );

        let alert_redactor = Redactor::with_patterns(&settings.redaction.extra_patterns)
            .unwrap_or_else(|_| Redactor::builtin());
        if let Some(planner_error) = &outcome.planner_error {
            self.alerter
                .raise(
                    FailureKind::PlannerCall,
                    "Planner retries exhausted; user received a degraded response",
                    &format!("{planner_error} | request: {}", request.text),
                    correlation_id,
                    thread_id,
                    &alert_redactor,
                )
                .await;
        }
        if let Some(redaction_error) = &formatted.redaction_error {
            self.alerter
                .raise(
                    FailureKind::Redaction,
                    "Response withheld because redaction could not run",
                    &redaction_error.to_string(),
                    correlation_id,
                    thread_id,
                    &alert_redactor,
                )
                .await;
        }
        for failure in outcome.tool_failures.iter().filter(|failure| failure.alert) {
            self.alerter
                .raise(
                    failure.kind,
                    &format!("Tool `{}` failed during an investigation", failure.tool),
                    &failure.message,
                    correlation_id,
                    thread_id,
                    &alert_redactor,
                )
                .await;
        }

        let metrics = RequestMetrics {
            duration: started.elapsed(),
            tools_used: outcome.tools_used.clone(),
            truncated: outcome.truncated,
            limit_hit: outcome.hit_limit,
            error: outcome.status == LoopStatus::Degraded || formatted.redaction_error.is_some(),
        };
        self.metrics.record(&metrics);

        info!(
            event_name = "agent.pipeline.finished",
            correlation_id,
            thread_id = thread_id.unwrap_or("unknown"),
            status = outcome.status.as_str(),
            turns = outcome.turns,
            duration_ms = metrics.duration_ms(),
            "request finished"
        );

        PipelineReply {
            text: formatted.text,
            tools_used: outcome.tools_used,
            hit_limit: outcome.hit_limit,
            status: outcome.status,
            metrics,
        }
    }
}
