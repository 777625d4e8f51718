use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventContext, EventDispatcher, SlackEnvelope, SlackEvent};
use crate::web::SlackApi;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// A decoded Socket Mode frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketFrame {
    Hello,
    Disconnect { reason: String },
    Envelope(SlackEnvelope),
    Other { frame_type: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

pub fn parse_socket_frame(text: &str) -> Result<SocketFrame, TransportError> {
    let raw = serde_json::from_str::<RawFrame>(text)
        .map_err(|error| TransportError::Receive(format!("malformed socket frame: {error}")))?;

    Ok(match raw.frame_type.as_str() {
        "hello" => SocketFrame::Hello,
        "disconnect" => SocketFrame::Disconnect { reason: raw.reason.unwrap_or_default() },
        "events_api" => {
            let envelope_id = raw.envelope_id.ok_or_else(|| {
                TransportError::Receive("events_api frame without envelope_id".to_owned())
            })?;
            let event = raw
                .payload
                .as_ref()
                .and_then(|payload| payload.get("event"))
                .map(SlackEvent::from_event_json)
                .unwrap_or_else(|| SlackEvent::Unsupported { event_type: "missing".to_owned() });
            SocketFrame::Envelope(SlackEnvelope { envelope_id, event })
        }
        other => SocketFrame::Other { frame_type: other.to_owned() },
    })
}

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket Mode over a websocket URL obtained from `apps.connections.open`.
pub struct SlackSocketTransport {
    api: Arc<dyn SlackApi>,
    stream: Mutex<Option<SocketStream>>,
}

impl SlackSocketTransport {
    pub fn new(api: Arc<dyn SlackApi>) -> Self {
        Self { api, stream: Mutex::new(None) }
    }
}

#[async_trait]
impl SocketTransport for SlackSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self
            .api
            .open_socket_url()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::Receive("socket is not connected".to_owned()));
        };

        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => return Err(TransportError::Receive(error.to_string())),
                None => return Err(TransportError::Receive("socket closed by peer".to_owned())),
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    return Err(TransportError::Receive(format!("socket closed: {frame:?}")));
                }
                _ => continue,
            };

            match parse_socket_frame(&text) {
                Ok(SocketFrame::Envelope(envelope)) => return Ok(Some(envelope)),
                Ok(SocketFrame::Hello) => debug!(event_name = "ingress.slack.hello", "socket mode ready"),
                Ok(SocketFrame::Disconnect { reason }) => {
                    return Err(TransportError::Receive(format!("slack requested reconnect: {reason}")));
                }
                Ok(SocketFrame::Other { frame_type }) => {
                    debug!(event_name = "ingress.slack.frame_skipped", frame_type = %frame_type, "skipping frame");
                }
                Err(error) => warn!(event_name = "ingress.slack.frame_invalid", error = %error, "skipping frame"),
            }
        }
    }

    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::Acknowledge("socket is not connected".to_owned()));
        };
        stream
            .send(Message::Text(json!({ "envelope_id": envelope_id }).to_string()))
            .await
            .map_err(|error| TransportError::Acknowledge(error.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Ok(());
        };
        stream.close(None).await.map_err(|error| TransportError::Disconnect(error.to_string()))
    }
}

pub struct SocketModeRunner {
    transport: Arc<dyn SocketTransport>,
    dispatcher: Arc<EventDispatcher>,
    reconnect_policy: ReconnectPolicy,
}

impl SocketModeRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        dispatcher: EventDispatcher,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher: Arc::new(dispatcher), reconnect_policy }
    }

    /// Pumps envelopes until the stream ends, shutdown is requested, or
    /// reconnects are exhausted. A successful connection resets the retry budget.
    pub async fn start(&self, shutdown: &CancellationToken) {
        let mut attempt = 0;
        loop {
            let pumped = tokio::select! {
                pumped = self.connect_and_pump(&mut attempt) => pumped,
                _ = shutdown.cancelled() => {
                    info!(event_name = "ingress.slack.shutdown", "socket mode runner stopping");
                    if let Err(error) = self.transport.disconnect().await {
                        warn!(error = %error, "socket mode disconnect failed");
                    }
                    return;
                }
            };

            let Err(transport_error) = pumped else {
                return;
            };
            warn!(
                attempt,
                max_retries = self.reconnect_policy.max_retries,
                error = %transport_error,
                "socket mode transport failed"
            );

            if attempt >= self.reconnect_policy.max_retries {
                warn!(
                    max_retries = self.reconnect_policy.max_retries,
                    "socket mode retries exhausted; continuing process without crash"
                );
                return;
            }

            let delay = self.reconnect_policy.backoff(attempt);
            attempt += 1;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    async fn connect_and_pump(&self, attempt: &mut u32) -> Result<(), TransportError> {
        info!(attempt = *attempt, "opening socket mode transport connection");
        self.transport.connect().await?;
        info!(attempt = *attempt, "socket mode transport connected");
        *attempt = 0;

        loop {
            let Some(envelope) = self.transport.next_envelope().await? else {
                info!("socket mode transport stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            let thread_id = envelope.event.thread_id().map(str::to_owned);

            info!(
                event_name = "ingress.slack.envelope_received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                correlation_id = %envelope.envelope_id,
                thread_id = thread_id.as_deref().unwrap_or("unknown"),
                "received slack envelope"
            );

            if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                warn!(
                    event_name = "ingress.slack.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_id = thread_id.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "failed to acknowledge slack envelope"
                );
            } else {
                debug!(
                    event_name = "ingress.slack.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_id = thread_id.as_deref().unwrap_or("unknown"),
                    "acknowledged slack envelope"
                );
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let context = EventContext { correlation_id: envelope.envelope_id.clone() };
                if let Err(error) = dispatcher.dispatch(&envelope, &context).await {
                    warn!(
                        envelope_id = %envelope.envelope_id,
                        correlation_id = %envelope.envelope_id,
                        thread_id = thread_id.as_deref().unwrap_or("unknown"),
                        error = %error,
                        "event dispatch failed; continuing socket loop"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::{parse_socket_frame, ReconnectPolicy, SocketFrame, SocketModeRunner, SocketTransport, TransportError};
    use crate::events::{EventDispatcher, SlackEnvelope, SlackEvent};

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        envelopes: VecDeque<Result<Option<SlackEnvelope>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            envelopes: Vec<Result<Option<SlackEnvelope>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }

        async fn acknowledgements(&self) -> Vec<String> {
            self.state.lock().await.acknowledgements.clone()
        }
    }

    #[async_trait]
    impl SocketTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
            let mut state = self.state.lock().await;
            state.envelopes.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.acknowledgements.push(envelope_id.to_owned());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.disconnect_calls += 1;
            Ok(())
        }
    }

    fn envelope(id: &str) -> SlackEnvelope {
        SlackEnvelope {
            envelope_id: id.to_owned(),
            event: SlackEvent::Unsupported { event_type: "test".to_owned() },
        }
    }

    fn runner(transport: Arc<ScriptedTransport>, max_retries: u32) -> SocketModeRunner {
        SocketModeRunner::new(
            transport,
            EventDispatcher::default(),
            ReconnectPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 },
        )
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(envelope("env-1"))), Ok(None)],
        ));

        runner(transport.clone(), 2).start(&CancellationToken::new()).await;

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1"]);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));

        runner(transport.clone(), 2).start(&CancellationToken::new()).await;
        assert_eq!(transport.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn successful_connection_resets_the_retry_budget() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Ok(()),
                Err(TransportError::Connect("fail-2".to_owned())),
                Ok(()),
            ],
            vec![
                Ok(Some(envelope("env-1"))),
                Err(TransportError::Receive("slack requested reconnect: refresh".to_owned())),
                Ok(Some(envelope("env-2"))),
                Ok(None),
            ],
        ));

        runner(transport.clone(), 2).start(&CancellationToken::new()).await;

        assert_eq!(transport.connect_attempts().await, 4);
        assert_eq!(transport.acknowledgements().await, vec!["env-1", "env-2"]);
    }

    #[tokio::test]
    async fn cancelled_runner_returns_and_disconnects() {
        let transport = Arc::new(ScriptedTransport::default());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        runner(transport.clone(), 2).start(&shutdown).await;

        assert!(transport.state.lock().await.disconnect_calls >= 1);
    }

    #[test]
    fn parses_events_api_hello_and_disconnect_frames() {
        let frame = parse_socket_frame(
            r#"{"type":"events_api","envelope_id":"e-1","payload":{"event":{"type":"app_mention","channel":"C1","user":"U1","text":"<@U0BOT> hi","ts":"1.0"}}}"#,
        )
        .expect("frame");
        let SocketFrame::Envelope(envelope) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.envelope_id, "e-1");
        assert!(matches!(envelope.event, SlackEvent::AppMention(_)));

        assert_eq!(parse_socket_frame(r#"{"type":"hello"}"#), Ok(SocketFrame::Hello));
        assert_eq!(
            parse_socket_frame(r#"{"type":"disconnect","reason":"refresh_requested"}"#),
            Ok(SocketFrame::Disconnect { reason: "refresh_requested".to_owned() })
        );
        assert!(parse_socket_frame("not json").is_err());
    }
}
