use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use opsdesk_agent::conversation::{is_operations_channel, ChannelContext, HistoryEntry};
use opsdesk_agent::{ChannelError, HostChannel, InboundRequest, RequestPipeline};
use opsdesk_core::domain::CorrelationId;
use regex::Regex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blocks::greeting_message;
use crate::events::{EventContext, EventHandlerError, HandlerResult, MessageEvent, ThreadMessageService};
use crate::markup::SlackMrkdwn;
use crate::web::{PostMessage, SlackApi, ThreadReply};

pub const THREAD_HISTORY_LIMIT: usize = 15;
const RESPONDED_CAPACITY: usize = 1_000;

static MENTION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<@\w+>").ok());

/// Threads that already received an automatic reply. Oldest half is
/// forgotten once the capacity is reached.
#[derive(Debug, Default)]
pub struct RespondedThreads {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RespondedThreads {
    /// Returns false when the thread was already answered.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= RESPONDED_CAPACITY {
            for stale in self.order.drain(..RESPONDED_CAPACITY / 2) {
                self.seen.remove(&stale);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Acknowledgment and reply are posted into the originating thread.
pub struct SlackThreadChannel {
    api: Arc<dyn SlackApi>,
    channel_id: String,
    thread_ts: String,
}

impl SlackThreadChannel {
    pub fn new(api: Arc<dyn SlackApi>, channel_id: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self { api, channel_id: channel_id.into(), thread_ts: thread_ts.into() }
    }

    async fn post(&self, text: &str) -> Result<(), ChannelError> {
        let message = PostMessage::text(self.channel_id.clone(), Some(&self.thread_ts), text);
        self.api
            .post_message(&message)
            .await
            .map(|_| ())
            .map_err(|error| ChannelError::Delivery(error.to_string()))
    }
}

#[async_trait]
impl HostChannel for SlackThreadChannel {
    async fn acknowledge(&self, text: &str) -> Result<(), ChannelError> {
        self.post(text).await
    }

    async fn reply(&self, text: &str) -> Result<(), ChannelError> {
        self.post(text).await
    }
}

/// Turns Slack messages into pipeline requests.
pub struct SlackThreadService {
    api: Arc<dyn SlackApi>,
    pipeline: Arc<RequestPipeline>,
    auto_reply_channels: HashSet<String>,
    responded: Mutex<RespondedThreads>,
    bot_user_id: OnceCell<String>,
    shutdown: CancellationToken,
}

impl SlackThreadService {
    pub fn new(
        api: Arc<dyn SlackApi>,
        pipeline: Arc<RequestPipeline>,
        auto_reply_channels: &[String],
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            pipeline,
            auto_reply_channels: auto_reply_channels.iter().cloned().collect(),
            responded: Mutex::new(RespondedThreads::default()),
            bot_user_id: OnceCell::new(),
            shutdown,
        }
    }

    fn mark_responded(&self, channel_id: &str, thread_ts: &str) -> bool {
        let mut responded = match self.responded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        responded.insert(format!("{channel_id}:{thread_ts}"))
    }

    async fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id
            .get_or_try_init(|| self.api.bot_user_id())
            .await
            .map(String::as_str)
            .map_err(|error| {
                warn!(
                    event_name = "slack.thread.auth_test_failed",
                    error = %error,
                    "could not resolve bot user id"
                );
            })
            .ok()
    }

    async fn channel_context(&self, channel_id: &str) -> ChannelContext {
        match self.api.channel_info(channel_id).await {
            Ok(info) if !info.name.is_empty() => {
                let keywords =
                    self.pipeline.settings().current().await.settings.operations_channel_keywords.clone();
                ChannelContext {
                    is_operations_channel: is_operations_channel(&info.name, &keywords),
                    channel_name: Some(info.name),
                }
            }
            Ok(_) => ChannelContext::default(),
            Err(error) => {
                warn!(
                    event_name = "slack.thread.channel_info_failed",
                    channel_id,
                    error = %error,
                    "could not fetch channel info"
                );
                ChannelContext::default()
            }
        }
    }

    async fn history(&self, event: &MessageEvent) -> Vec<HistoryEntry> {
        if !event.is_thread_reply() {
            return Vec::new();
        }
        let replies = match self
            .api
            .thread_replies(&event.channel_id, event.thread_root(), THREAD_HISTORY_LIMIT)
            .await
        {
            Ok(replies) => replies,
            Err(error) => {
                warn!(
                    event_name = "slack.thread.history_failed",
                    thread_id = event.thread_root(),
                    error = %error,
                    "could not fetch thread history"
                );
                return Vec::new();
            }
        };
        let bot_user_id = self.bot_user_id().await;
        history_from_replies(&replies, &event.ts, bot_user_id)
    }

    async fn run(
        &self,
        event: &MessageEvent,
        text: String,
        history: Vec<HistoryEntry>,
        ctx: &EventContext,
    ) -> HandlerResult {
        let thread_ts = event.thread_root().to_owned();
        let request = InboundRequest {
            text,
            history,
            channel: self.channel_context(&event.channel_id).await,
            correlation_id: CorrelationId(ctx.correlation_id.clone()),
            thread_id: Some(thread_ts.clone()),
        };
        let channel = SlackThreadChannel::new(self.api.clone(), event.channel_id.clone(), thread_ts);
        let reply = self
            .pipeline
            .handle(&request, &channel, &SlackMrkdwn, &self.shutdown.child_token())
            .await;

        info!(
            event_name = "slack.thread.replied",
            correlation_id = %ctx.correlation_id,
            thread_id = event.thread_root(),
            status = reply.status.as_str(),
            tools_used = reply.tools_used.len(),
            "thread request handled"
        );
        HandlerResult::Replied
    }
}

#[async_trait]
impl ThreadMessageService for SlackThreadService {
    async fn handle_mention(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let text = strip_mentions(&event.text);
        if text.is_empty() {
            let greeting =
                PostMessage::template(event.channel_id.clone(), Some(event.thread_root()), greeting_message());
            self.api
                .post_message(&greeting)
                .await
                .map_err(|error| EventHandlerError::WebApi(error.to_string()))?;
            return Ok(HandlerResult::Replied);
        }

        self.mark_responded(&event.channel_id, event.thread_root());
        let history = self.history(event).await;
        Ok(self.run(event, text, history, ctx).await)
    }

    async fn handle_channel_message(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        if !self.auto_reply_channels.contains(&event.channel_id) || event.text.trim().is_empty() {
            return Ok(HandlerResult::Ignored);
        }
        if let Some(bot_user_id) = self.bot_user_id().await {
            let from_bot = event.user_id.as_deref() == Some(bot_user_id);
            if from_bot || event.text.contains(&format!("<@{bot_user_id}>")) {
                return Ok(HandlerResult::Ignored);
            }
        }
        if !self.mark_responded(&event.channel_id, &event.ts) {
            return Ok(HandlerResult::Ignored);
        }

        Ok(self.run(event, event.text.clone(), Vec::new(), ctx).await)
    }
}

pub fn strip_mentions(text: &str) -> String {
    match MENTION.as_ref() {
        Some(mention) => mention.replace_all(text, "").trim().to_owned(),
        None => text.trim().to_owned(),
    }
}

/// Prior thread messages, excluding the one being answered.
fn history_from_replies(
    replies: &[ThreadReply],
    current_ts: &str,
    bot_user_id: Option<&str>,
) -> Vec<HistoryEntry> {
    replies
        .iter()
        .filter(|reply| reply.ts != current_ts)
        .map(|reply| {
            let from_bot = reply.bot_id.is_some()
                || (bot_user_id.is_some() && reply.user.as_deref() == bot_user_id);
            if from_bot {
                HistoryEntry::bot(reply.text.clone())
            } else {
                HistoryEntry::user(strip_mentions(&reply.text))
            }
        })
        .collect()
}
