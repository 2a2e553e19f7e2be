//! Capstan runtime: a tool-calling agent loop.
//!
//! This crate drives conversations between a model provider and a set of
//! tools, keeping session history well-formed along the way.
//!
//! # Overview
//!
//! - **Agent**: runs one query at a time per session through the
//!   `AwaitingModel` / `ExecutingTools` loop, with an iteration limit and a
//!   forced final answer.
//! - **Provider**: a trait over model backends that yields a stream of
//!   events; [`AnthropicProvider`] is the bundled implementation.
//! - **Detector**: turns native tool-call fragments, or JSON in plain text
//!   for providers without native tool calling, into [`ToolCall`]s.
//! - **Executor**: validates, circuit-breaks, times out and truncates tool
//!   invocations against a [`ToolRegistry`].
//! - **Repair** and **compaction**: restore call/result pairing and keep the
//!   history under the context budget.
//!
//! # Example
//!
//! ```ignore
//! use runtime::{Agent, AnthropicProvider, EmptyRegistry, SqliteStore};
//! use storage::{EventStore, SessionId};
//!
//! # async fn example() -> runtime::Result<()> {
//! let provider = AnthropicProvider::builder("sk-ant-api01-...", "claude-sonnet-4-20250514").build();
//! let store = SqliteStore::new(EventStore::in_memory()?);
//! let agent = Agent::builder(provider, EmptyRegistry, store).build()?;
//!
//! let answer = agent.process("Hello!", SessionId::new()).await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod compaction;
pub mod config;
pub mod detect;
mod error;
pub mod executor;
mod history;
pub mod model;
pub mod provider;
pub mod repair;
pub mod session;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentBuilder, LoopState, RuntimeEvent};
pub use config::{BusyPolicy, ContextConfig, RetryConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use history::History;
pub use model::{
    Message, MessageKind, ModelError, Role, StopReason, ToolCall, ToolChoice, ToolResult,
    ToolSpec, ToolStatus,
};
pub use provider::{AnthropicProvider, Provider};
pub use repair::{RepairReport, repair};
pub use session::{MemoryStore, SessionStore, SqliteStore, decode_messages};
pub use tools::{EmptyRegistry, ToolAllowList, ToolError, ToolRegistry};
