//! Slack front end for the opsdesk request pipeline.
//!
//! - `socket` - Socket Mode websocket loop with reconnection
//! - `events` - envelope decoding and handler dispatch
//! - `thread` - mention and auto-reply handling per thread
//! - `web` - Web API client (`chat.postMessage`, `conversations.*`)
//! - `markup` - markdown to mrkdwn conversion
//! - `blocks` - Block Kit builders for greetings and alerts
//! - `alerts` - alert sink posting to the operational channel
//!
//! ```text
//! Socket Mode → EventDispatcher → SlackThreadService → RequestPipeline
//!                                        ↓
//!                          chat.postMessage (thread reply)
//! ```

pub mod alerts;
pub mod blocks;
pub mod events;
pub mod markup;
pub mod socket;
pub mod thread;
pub mod web;

#[cfg(test)]
mod testing;

pub use alerts::SlackAlertSink;
pub use events::{thread_dispatcher, EventDispatcher};
pub use socket::{ReconnectPolicy, SlackSocketTransport, SocketModeRunner};
pub use thread::SlackThreadService;
pub use web::{SlackApi, SlackWebClient};
