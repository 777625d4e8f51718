use std::sync::Arc;

use async_trait::async_trait;
use opsdesk_core::errors::FailureKind;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::format::Redactor;

pub const ALERT_CONTEXT_MAX_CHARS: usize = 200;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: &'static str,
    pub summary: String,
    pub context: String,
    pub correlation_id: String,
    pub thread_id: Option<String>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log. Used when no operational channel is configured
/// and as the fallback when delivery fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        error!(
            event_name = "agent.alert.raised",
            alert_kind = alert.kind,
            correlation_id = %alert.correlation_id,
            thread_id = alert.thread_id.as_deref().unwrap_or("unknown"),
            context = %alert.context,
            "{}",
            alert.summary
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Alerter {
    sink: Arc<dyn AlertSink>,
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new(Arc::new(TracingAlertSink))
    }
}

impl Alerter {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }

    /// Redacts and then truncates the context before it leaves the process.
    pub async fn raise(
        &self,
        kind: FailureKind,
        summary: &str,
        context: &str,
        correlation_id: &str,
        thread_id: Option<&str>,
        redactor: &Redactor,
    ) {
        let context =
            redactor.redact(context).chars().take(ALERT_CONTEXT_MAX_CHARS).collect::<String>();
        let alert = Alert {
            kind: kind.as_str(),
            summary: redactor.redact(summary),
            context,
            correlation_id: correlation_id.to_string(),
            thread_id: thread_id.map(str::to_string),
        };

        if let Err(delivery_error) = self.sink.send(&alert).await {
            warn!(
                event_name = "agent.alert.delivery_failed",
                correlation_id,
                error = %delivery_error,
                "alert sink failed; logging alert instead"
            );
            let _ = TracingAlertSink.send(&alert).await;
        }
    }
}
