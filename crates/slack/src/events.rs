use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const IGNORED_SUBTYPES: &[&str] = &["bot_message", "message_changed", "message_deleted"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    AppMention(MessageEvent),
    ChannelMessage(MessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::AppMention(_) => SlackEventType::AppMention,
            Self::ChannelMessage(_) => SlackEventType::ChannelMessage,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }

    /// Timestamp of the thread the event belongs to.
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::AppMention(event) | Self::ChannelMessage(event) => Some(event.thread_root()),
            Self::Unsupported { .. } => None,
        }
    }

    /// Decodes the `event` object of an Events API payload.
    pub fn from_event_json(event: &Value) -> Self {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let decoded = || serde_json::from_value::<MessageEvent>(event.clone()).ok();
        match event_type {
            "app_mention" => decoded().map(Self::AppMention),
            "message" => decoded().map(Self::ChannelMessage),
            _ => None,
        }
        .unwrap_or_else(|| Self::Unsupported { event_type: event_type.to_owned() })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    AppMention,
    ChannelMessage,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MessageEvent {
    #[serde(rename = "channel")]
    pub channel_id: String,
    #[serde(rename = "user", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

impl MessageEvent {
    pub fn thread_root(&self) -> &str {
        self.thread_ts.as_deref().unwrap_or(&self.ts)
    }

    pub fn is_thread_reply(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|thread_ts| thread_ts != self.ts)
    }

    /// Bot posts and edit/delete notifications never start an investigation.
    pub fn is_ignorable(&self) -> bool {
        self.bot_id.is_some()
            || self.subtype.as_deref().is_some_and(|subtype| IGNORED_SUBTYPES.contains(&subtype))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Replied,
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("thread message handler failure: {0}")]
    ThreadMessage(String),
    #[error("slack web api failure: {0}")]
    WebApi(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Receives the message events that can start or continue an investigation.
#[async_trait]
pub trait ThreadMessageService: Send + Sync {
    async fn handle_mention(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;

    async fn handle_channel_message(
        &self,
        event: &MessageEvent,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

/// Registers mention and channel-message handlers backed by one service.
pub fn thread_dispatcher<S>(service: Arc<S>) -> EventDispatcher
where
    S: ThreadMessageService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(MentionHandler { service: service.clone() });
    dispatcher.register(ChannelMessageHandler { service });
    dispatcher
}

pub struct MentionHandler<S> {
    service: Arc<S>,
}

#[async_trait]
impl<S> EventHandler for MentionHandler<S>
where
    S: ThreadMessageService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::AppMention
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::AppMention(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        self.service.handle_mention(event, ctx).await
    }
}

pub struct ChannelMessageHandler<S> {
    service: Arc<S>,
}

#[async_trait]
impl<S> EventHandler for ChannelMessageHandler<S>
where
    S: ThreadMessageService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::ChannelMessage
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::ChannelMessage(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };
        if event.is_ignorable() || event.is_thread_reply() {
            return Ok(HandlerResult::Ignored);
        }

        self.service.handle_channel_message(event, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::{
        thread_dispatcher, EventContext, EventDispatcher, EventHandlerError, HandlerResult,
        MessageEvent, SlackEnvelope, SlackEvent, ThreadMessageService,
    };

    #[derive(Default)]
    struct RecordingService {
        mentions: Mutex<Vec<String>>,
        channel_messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ThreadMessageService for RecordingService {
        async fn handle_mention(
            &self,
            event: &MessageEvent,
            _ctx: &EventContext,
        ) -> Result<HandlerResult, EventHandlerError> {
            self.mentions.lock().await.push(event.text.clone());
            Ok(HandlerResult::Replied)
        }

        async fn handle_channel_message(
            &self,
            event: &MessageEvent,
            _ctx: &EventContext,
        ) -> Result<HandlerResult, EventHandlerError> {
            self.channel_messages.lock().await.push(event.text.clone());
            Ok(HandlerResult::Replied)
        }
    }

    fn message(text: &str, thread_ts: Option<&str>) -> MessageEvent {
        MessageEvent {
            channel_id: "C1".to_owned(),
            user_id: Some("U1".to_owned()),
            text: text.to_owned(),
            ts: "1730000000.1000".to_owned(),
            thread_ts: thread_ts.map(str::to_owned),
            subtype: None,
            bot_id: None,
        }
    }

    #[test]
    fn decodes_mentions_messages_and_unknown_events() {
        let mention = SlackEvent::from_event_json(&json!({
            "type": "app_mention",
            "channel": "C1",
            "user": "U1",
            "text": "<@UBOT> errors in service-x",
            "ts": "1730000000.2000",
            "thread_ts": "1730000000.1000"
        }));
        let SlackEvent::AppMention(event) = &mention else {
            panic!("expected app mention, got {mention:?}");
        };
        assert_eq!(event.thread_root(), "1730000000.1000");
        assert!(event.is_thread_reply());

        let message = SlackEvent::from_event_json(&json!({
            "type": "message", "channel": "C1", "text": "deploy failed", "ts": "1.0"
        }));
        assert_eq!(message.thread_id(), Some("1.0"));

        let reaction = SlackEvent::from_event_json(&json!({ "type": "reaction_added" }));
        assert_eq!(reaction, SlackEvent::Unsupported { event_type: "reaction_added".to_owned() });
    }

    #[test]
    fn bot_posts_and_edits_are_ignorable() {
        let mut edited = message("fixed typo", None);
        edited.subtype = Some("message_changed".to_owned());
        assert!(edited.is_ignorable());

        let mut from_bot = message("On it...", None);
        from_bot.bot_id = Some("B1".to_owned());
        assert!(from_bot.is_ignorable());

        assert!(!message("help", None).is_ignorable());
    }

    #[tokio::test]
    async fn dispatcher_returns_ignored_when_no_handler_registered() {
        let dispatcher = EventDispatcher::new();
        let envelope = SlackEnvelope {
            envelope_id: "env-1".to_owned(),
            event: SlackEvent::AppMention(message("hello", None)),
        };

        let result =
            dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert_eq!(result, HandlerResult::Ignored);
    }

    #[tokio::test]
    async fn thread_dispatcher_routes_mentions_and_top_level_messages() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = thread_dispatcher(service.clone());
        assert_eq!(dispatcher.handler_count(), 2);

        for (envelope_id, event) in [
            ("env-1", SlackEvent::AppMention(message("<@UBOT> status", None))),
            ("env-2", SlackEvent::ChannelMessage(message("prod is down", None))),
        ] {
            let envelope = SlackEnvelope { envelope_id: envelope_id.to_owned(), event };
            let result =
                dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");
            assert_eq!(result, HandlerResult::Replied);
        }

        assert_eq!(service.mentions.lock().await.as_slice(), &["<@UBOT> status".to_owned()]);
        assert_eq!(service.channel_messages.lock().await.as_slice(), &["prod is down".to_owned()]);
    }

    #[tokio::test]
    async fn thread_replies_without_mention_are_not_auto_answered() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = thread_dispatcher(service.clone());
        let envelope = SlackEnvelope {
            envelope_id: "env-3".to_owned(),
            event: SlackEvent::ChannelMessage(message("thanks!", Some("1720000000.0001"))),
        };

        let result =
            dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert_eq!(result, HandlerResult::Ignored);
        assert!(service.channel_messages.lock().await.is_empty());
    }
}
