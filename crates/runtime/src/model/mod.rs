//! Conversation types and provider errors.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    Message, MessageId, MessageKind, Role, StopReason, ToolCall, ToolChoice, ToolResult,
    ToolSpec, ToolStatus, Usage,
};
