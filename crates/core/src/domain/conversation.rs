use crate::domain::message::Message;

/// Mutable state of one orchestration run. Never shared across requests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub turn: u32,
    pub tools_used: Vec<String>,
}

impl ConversationState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, turn: 0, tools_used: Vec::new() }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn record_tool(&mut self, name: impl Into<String>) {
        self.tools_used.push(name.into());
    }

    pub fn advance_turn(&mut self) -> u32 {
        self.turn = self.turn.saturating_add(1);
        self.turn
    }
}

/// Identifier threaded through every log line and alert of one request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
