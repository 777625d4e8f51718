use std::time::Duration;

use async_trait::async_trait;
use opsdesk_core::config::SlackConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::blocks::{Block, MessageTemplate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebApiError {
    #[error("slack request failed: {0}")]
    Transport(String),
    #[error("slack returned status {status}")]
    Status { status: u16 },
    #[error("slack method `{method}` failed: {error}")]
    Api { method: &'static str, error: String },
    #[error("slack response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PostMessage {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl PostMessage {
    pub fn text(channel: impl Into<String>, thread_ts: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: thread_ts.map(str::to_owned),
            text: text.into(),
            blocks: Vec::new(),
        }
    }

    pub fn template(channel: impl Into<String>, thread_ts: Option<&str>, template: MessageTemplate) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: thread_ts.map(str::to_owned),
            text: template.fallback_text,
            blocks: template.blocks,
        }
    }
}

/// One message of a thread as returned by `conversations.replies`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ThreadReply {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

#[async_trait]
pub trait SlackApi: Send + Sync {
    /// Returns the `ts` of the posted message.
    async fn post_message(&self, message: &PostMessage) -> Result<String, WebApiError>;
    async fn thread_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ThreadReply>, WebApiError>;
    async fn channel_info(&self, channel: &str) -> Result<ChannelInfo, WebApiError>;
    async fn bot_user_id(&self) -> Result<String, WebApiError>;
    /// Requests a fresh Socket Mode websocket URL.
    async fn open_socket_url(&self) -> Result<String, WebApiError>;
}

pub struct SlackWebClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: SecretString,
    app_token: SecretString,
}

impl SlackWebClient {
    pub fn new(
        base_url: impl Into<String>,
        bot_token: SecretString,
        app_token: SecretString,
    ) -> Result<Self, WebApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| WebApiError::Transport(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            bot_token,
            app_token,
        })
    }

    pub fn from_config(config: &SlackConfig) -> Result<Self, WebApiError> {
        Self::new(config.api_base_url.clone(), config.bot_token.clone(), config.app_token.clone())
    }

    async fn call<T>(
        &self,
        method: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, WebApiError>
    where
        T: DeserializeOwned,
    {
        debug!(event_name = "slack.web.request", method, "calling slack web api");
        let response =
            request.send().await.map_err(|error| WebApiError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebApiError::Status { status: status.as_u16() });
        }

        let body =
            response.json::<Value>().await.map_err(|error| WebApiError::Decode(error.to_string()))?;
        decode_body(method, body)
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }
}

/// Slack reports failures as `200 {"ok": false, "error": "..."}`.
fn decode_body<T>(method: &'static str, body: Value) -> Result<T, WebApiError>
where
    T: DeserializeOwned,
{
    if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
        return Err(WebApiError::Api { method, error: error.to_owned() });
    }
    serde_json::from_value::<T>(body).map_err(|error| WebApiError::Decode(error.to_string()))
}

#[derive(Deserialize)]
struct PostMessageBody {
    ts: String,
}

#[derive(Deserialize)]
struct RepliesBody {
    #[serde(default)]
    messages: Vec<ThreadReply>,
}

#[derive(Deserialize)]
struct ChannelBody {
    channel: ChannelInfo,
}

#[derive(Deserialize)]
struct AuthBody {
    user_id: String,
}

#[derive(Deserialize)]
struct ConnectionBody {
    url: String,
}

#[async_trait]
impl SlackApi for SlackWebClient {
    async fn post_message(&self, message: &PostMessage) -> Result<String, WebApiError> {
        let request = self
            .http
            .post(self.url("chat.postMessage"))
            .bearer_auth(self.bot_token.expose_secret())
            .json(message);
        let body: PostMessageBody = self.call("chat.postMessage", request).await?;
        Ok(body.ts)
    }

    async fn thread_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ThreadReply>, WebApiError> {
        let limit = limit.to_string();
        let request = self
            .http
            .get(self.url("conversations.replies"))
            .bearer_auth(self.bot_token.expose_secret())
            .query(&[("channel", channel), ("ts", thread_ts), ("limit", limit.as_str())]);
        let body: RepliesBody = self.call("conversations.replies", request).await?;
        Ok(body.messages)
    }

    async fn channel_info(&self, channel: &str) -> Result<ChannelInfo, WebApiError> {
        let request = self
            .http
            .get(self.url("conversations.info"))
            .bearer_auth(self.bot_token.expose_secret())
            .query(&[("channel", channel)]);
        let body: ChannelBody = self.call("conversations.info", request).await?;
        Ok(body.channel)
    }

    async fn bot_user_id(&self) -> Result<String, WebApiError> {
        let request =
            self.http.post(self.url("auth.test")).bearer_auth(self.bot_token.expose_secret());
        let body: AuthBody = self.call("auth.test", request).await?;
        Ok(body.user_id)
    }

    async fn open_socket_url(&self) -> Result<String, WebApiError> {
        let request = self
            .http
            .post(self.url("apps.connections.open"))
            .bearer_auth(self.app_token.expose_secret());
        let body: ConnectionBody = self.call("apps.connections.open", request).await?;
        Ok(body.url)
    }
}
