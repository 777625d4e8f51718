use std::sync::Arc;

use async_trait::async_trait;
use opsdesk_agent::alerting::{Alert, AlertError, AlertSink};

use crate::blocks::alert_message;
use crate::web::{PostMessage, SlackApi};

/// Posts alerts to the operational channel.
pub struct SlackAlertSink {
    api: Arc<dyn SlackApi>,
    channel_id: String,
}

impl SlackAlertSink {
    pub fn new(api: Arc<dyn SlackApi>, channel_id: impl Into<String>) -> Self {
        Self { api, channel_id: channel_id.into() }
    }
}

#[async_trait]
impl AlertSink for SlackAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let message = PostMessage::template(self.channel_id.clone(), None, alert_message(alert));
        self.api
            .post_message(&message)
            .await
            .map(|_| ())
            .map_err(|error| AlertError::Delivery(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opsdesk_agent::alerting::{Alert, AlertError, AlertSink};

    use super::SlackAlertSink;
    use crate::testing::FakeSlackApi;

    fn alert() -> Alert {
        Alert {
            kind: "redaction_failure",
            summary: "Response withheld".to_owned(),
            context: "pattern `(` is invalid".to_owned(),
            correlation_id: "req-7".to_owned(),
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn alert_is_posted_to_the_configured_channel() {
        let api = Arc::new(FakeSlackApi::default());
        let sink = SlackAlertSink::new(api.clone(), "C0ALERTS");

        sink.send(&alert()).await.expect("send");

        let posts = api.posts.lock().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, "C0ALERTS");
        assert!(posts[0].text.contains("redaction_failure"));
        assert!(!posts[0].blocks.is_empty());
    }

    #[tokio::test]
    async fn post_failure_becomes_delivery_error() {
        let api = Arc::new(FakeSlackApi::failing_posts());
        let sink = SlackAlertSink::new(api, "C0ALERTS");

        let error = sink.send(&alert()).await.expect_err("should fail");
        assert!(matches!(error, AlertError::Delivery(message) if message.contains("not_in_channel")));
    }
}
