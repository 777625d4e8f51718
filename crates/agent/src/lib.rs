//! Orchestration engine: turns a free-text operational request into a bounded
//! sequence of tool calls planned by a hosted model.
//!
//! Request flow:
//! 1. **Enhancement** (`enhancer`) appends service/environment/time hints, fail-open.
//! 2. **Conversation** (`conversation`) windows the thread history into planner messages.
//! 3. **Loop** (`runtime`) alternates planner calls and tool turns until an answer
//!    or the turn budget.
//! 4. **Dispatch** (`dispatcher`, `tools`, `guardrails`) validates, screens and
//!    executes each tool call, always producing a structured result.
//! 5. **Formatting** (`format`) converts markup and masks credentials.
//!
//! `metrics` and `alerting` observe every request; `pipeline` wires it all together.

pub mod alerting;
pub mod conversation;
pub mod dispatcher;
pub mod enhancer;
pub mod format;
pub mod guardrails;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod runtime;
pub mod tools;

pub use pipeline::{ChannelError, HostChannel, InboundRequest, PipelineReply, RequestPipeline};
pub use runtime::{AgentRuntime, LoopConfig, LoopOutcome, LoopStatus};
