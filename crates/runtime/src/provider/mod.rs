//! Provider adapter boundary.
//!
//! A provider turns a request into a stream of [`ProviderEvent`]s. Native
//! tool-calling providers emit tool calls as [`ToolCallChunk`] fragments;
//! text-only providers emit only text and leave detection to the runtime.

mod anthropic;
mod assemble;
mod retry;

pub use anthropic::{AnthropicProvider, AnthropicProviderBuilder};
pub use assemble::{AssembledResponse, NativeCall, ResponseAssembler};
pub(crate) use retry::send_with_retry;

use crate::model::{Message, ModelError, StopReason, ToolChoice, ToolSpec, Usage};
use futures_util::stream::BoxStream;
use std::future::Future;

/// A fragment of a native tool call.
///
/// Fragments with the same `index` belong to the same call; `id` and
/// `name` usually arrive on the first fragment and `arguments` is
/// concatenated across fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallChunk {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One event from a provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Assistant text.
    Text(String),
    /// A native tool-call fragment.
    ToolCall(ToolCallChunk),
    /// Informational progress from the provider.
    Status(String),
    /// The provider failed mid-response.
    Error(String),
    /// The response finished.
    Complete { stop: StopReason, usage: Usage },
}

/// Stream of provider events.
pub type EventStream = BoxStream<'static, Result<ProviderEvent, ModelError>>;

/// Everything needed for a model request.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub tool_choice: ToolChoice,
    /// Whether the caller consumes the response incrementally.
    pub stream: bool,
    /// Tool-call format instructions for providers without native tool
    /// calling; adapters append them to the system prompt.
    pub tool_instructions: Option<&'a str>,
}

/// Trait for LLM provider adapters.
pub trait Provider: Send + Sync {
    /// Whether tool calls arrive as structured blocks.
    fn supports_native_tool_calls(&self) -> bool;

    /// Send a request and return its event stream.
    fn send(
        &self,
        request: ProviderRequest<'_>,
    ) -> impl Future<Output = Result<EventStream, ModelError>> + Send;
}

/// Text appended to the system prompt of providers without native tool calling.
pub fn text_tool_instructions(tools: &[ToolSpec]) -> String {
    let mut out = String::from(
        "## Tool calling\n\n\
         To call a tool, reply with a JSON object on its own, in exactly this shape:\n\n\
         {\"tool\": \"<tool name>\", \"arguments\": {<argument name>: <value>}}\n\n\
         Only the tools listed below exist. After a tool call, stop and wait for the result. \
         Never invent or predict tool results.\n\n## Available tools\n\n",
    );
    for tool in tools {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.brief()));
        out.push_str(&format!("  arguments schema: {}\n", tool.schema));
    }
    out
}
