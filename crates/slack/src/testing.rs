use std::sync::Arc;

use async_trait::async_trait;
use opsdesk_agent::alerting::Alerter;
use opsdesk_agent::enhancer::ContextEnhancer;
use opsdesk_agent::llm::{Planner, PlannerError, PlannerRequest, PlannerResponse, StopReason};
use opsdesk_agent::metrics::MetricsRecorder;
use opsdesk_agent::tools::{FixedCatalog, ToolCatalog};
use opsdesk_agent::RequestPipeline;
use opsdesk_core::domain::ContentBlock;
use opsdesk_core::settings::{RuntimeSettings, SnapshotStore};
use tokio::sync::Mutex;

use crate::web::{ChannelInfo, PostMessage, SlackApi, ThreadReply, WebApiError};

pub const BOT_USER_ID: &str = "U0BOT";

#[derive(Default)]
pub struct FakeSlackApi {
    pub posts: Mutex<Vec<PostMessage>>,
    pub replies: Vec<ThreadReply>,
    pub channel: ChannelInfo,
    pub fail_posts: bool,
}

impl FakeSlackApi {
    pub fn with_channel(channel: ChannelInfo) -> Self {
        Self { channel, ..Self::default() }
    }

    pub fn failing_posts() -> Self {
        Self { fail_posts: true, ..Self::default() }
    }
}

#[async_trait]
impl SlackApi for FakeSlackApi {
    async fn post_message(&self, message: &PostMessage) -> Result<String, WebApiError> {
        if self.fail_posts {
            return Err(WebApiError::Api {
                method: "chat.postMessage",
                error: "not_in_channel".to_owned(),
            });
        }
        let mut posts = self.posts.lock().await;
        posts.push(message.clone());
        Ok(format!("1730000000.{:04}", posts.len()))
    }

    async fn thread_replies(
        &self,
        _channel: &str,
        _thread_ts: &str,
        _limit: usize,
    ) -> Result<Vec<ThreadReply>, WebApiError> {
        Ok(self.replies.clone())
    }

    async fn channel_info(&self, _channel: &str) -> Result<ChannelInfo, WebApiError> {
        Ok(self.channel.clone())
    }

    async fn bot_user_id(&self) -> Result<String, WebApiError> {
        Ok(BOT_USER_ID.to_owned())
    }

    async fn open_socket_url(&self) -> Result<String, WebApiError> {
        Ok("wss://example.invalid/link".to_owned())
    }
}

struct AnsweringPlanner(String);

#[async_trait]
impl Planner for AnsweringPlanner {
    async fn plan(&self, _request: &PlannerRequest) -> Result<PlannerResponse, PlannerError> {
        Ok(PlannerResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::text(self.0.clone())],
        })
    }
}

/// Pipeline whose planner answers every request with `answer` and no tool calls.
pub fn pipeline_answering(answer: &str) -> Arc<RequestPipeline> {
    Arc::new(RequestPipeline::new(
        Arc::new(SnapshotStore::fixed(RuntimeSettings::default())),
        ContextEnhancer::rules_only(),
        Arc::new(AnsweringPlanner(answer.to_owned())),
        Arc::new(FixedCatalog(Arc::new(ToolCatalog::new("chat")))),
        Arc::new(MetricsRecorder::default()),
        Alerter::default(),
    ))
}
