pub mod config;
pub mod domain;
pub mod errors;
pub mod settings;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::{
    ContentBlock, ConversationState, CorrelationId, Message, MessageContent, RequestMetrics, Role,
    ToolCall, ToolCallId, ToolResult,
};
pub use errors::{ApplicationError, DomainError, FailureKind, InterfaceError};
pub use settings::{
    FileSettingsSource, RuntimeSettings, SettingsError, SettingsSource, Snapshot, SnapshotStore,
    StaticSettingsSource, ToolDefinition,
};
