pub mod conversation;
pub mod message;
pub mod metrics;
pub mod tool;

pub use conversation::{ConversationState, CorrelationId};
pub use message::{ContentBlock, Message, MessageContent, Role};
pub use metrics::RequestMetrics;
pub use tool::{ToolCall, ToolCallId, ToolResult};
