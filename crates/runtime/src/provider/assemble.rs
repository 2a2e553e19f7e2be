//! Assembly of streamed provider events into one response.

use super::{ProviderEvent, ToolCallChunk};
use crate::model::{StopReason, Usage};
use std::collections::BTreeMap;
use tracing::debug;

/// A native tool call with all fragments joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCall {
    pub id: Option<String>,
    pub name: String,
    /// Concatenated argument text, not yet parsed.
    pub arguments: String,
}

/// The assembled result of one provider response.
#[derive(Debug, Clone)]
pub struct AssembledResponse {
    pub text: String,
    /// Native calls, in index order. Empty unless the response completed.
    pub native_calls: Vec<NativeCall>,
    pub stop: StopReason,
    pub usage: Usage,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates text and tool-call fragments at chunk boundaries.
///
/// Partial calls are only released by a `Complete` event, so a response
/// that fails or is aborted mid-stream never yields a half-parsed call.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    outcome: Option<(StopReason, Usage)>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event.
    pub fn push(&mut self, event: &ProviderEvent) {
        if self.outcome.is_some() {
            debug!("ignoring provider event after completion");
            return;
        }
        match event {
            ProviderEvent::Text(text) => self.text.push_str(text),
            ProviderEvent::ToolCall(chunk) => self.push_chunk(chunk),
            ProviderEvent::Status(_) => {}
            ProviderEvent::Error(message) => {
                self.calls.clear();
                self.outcome = Some((StopReason::Error(message.clone()), Usage::default()));
            }
            ProviderEvent::Complete { stop, usage } => {
                self.outcome = Some((stop.clone(), *usage));
            }
        }
    }

    fn push_chunk(&mut self, chunk: &ToolCallChunk) {
        let call = self.calls.entry(chunk.index).or_default();
        if let Some(id) = &chunk.id {
            call.id = Some(id.clone());
        }
        if let Some(name) = &chunk.name {
            call.name.push_str(name);
        }
        call.arguments.push_str(&chunk.arguments);
    }

    /// Discard partial calls and mark the response aborted.
    pub fn abort(self) -> AssembledResponse {
        AssembledResponse {
            text: self.text,
            native_calls: Vec::new(),
            stop: StopReason::Aborted,
            usage: Usage::default(),
        }
    }

    /// Finish assembly.
    pub fn finish(self) -> AssembledResponse {
        let Some((stop, usage)) = self.outcome else {
            return AssembledResponse {
                text: self.text,
                native_calls: Vec::new(),
                stop: StopReason::Error("stream ended before completion".into()),
                usage: Usage::default(),
            };
        };
        let native_calls = self
            .calls
            .into_values()
            .map(|call| NativeCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        AssembledResponse {
            text: self.text,
            native_calls,
            stop,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> ProviderEvent {
        ProviderEvent::ToolCall(ToolCallChunk {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.into(),
        })
    }

    fn complete() -> ProviderEvent {
        ProviderEvent::Complete {
            stop: StopReason::ToolUse,
            usage: Usage::default(),
        }
    }

    #[test]
    fn joins_fragments_by_index() {
        let mut asm = ResponseAssembler::new();
        asm.push(&ProviderEvent::Text("Let me ".into()));
        asm.push(&chunk(1, Some("b"), Some("second"), "{}"));
        asm.push(&chunk(0, Some("a"), Some("get_state"), "{\"entity"));
        asm.push(&ProviderEvent::Text("check.".into()));
        asm.push(&chunk(0, None, None, "_id\":\"x\"}"));
        asm.push(&complete());

        let response = asm.finish();
        assert_eq!(response.text, "Let me check.");
        assert_eq!(response.stop, StopReason::ToolUse);
        assert_eq!(response.native_calls.len(), 2);
        assert_eq!(response.native_calls[0].name, "get_state");
        assert_eq!(response.native_calls[0].arguments, "{\"entity_id\":\"x\"}");
        assert_eq!(response.native_calls[1].id.as_deref(), Some("b"));
    }

    #[test]
    fn error_event_discards_partial_calls() {
        let mut asm = ResponseAssembler::new();
        asm.push(&ProviderEvent::Text("partial".into()));
        asm.push(&chunk(0, Some("a"), Some("get_state"), "{\"ent"));
        asm.push(&ProviderEvent::Error("overloaded".into()));

        let response = asm.finish();
        assert_eq!(response.text, "partial");
        assert!(response.native_calls.is_empty());
        assert_eq!(response.stop, StopReason::Error("overloaded".into()));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut asm = ResponseAssembler::new();
        asm.push(&chunk(0, Some("a"), Some("get_state"), "{}"));
        let response = asm.finish();
        assert!(response.native_calls.is_empty());
        assert!(response.stop.is_interrupted());
    }

    #[test]
    fn abort_keeps_text_only() {
        let mut asm = ResponseAssembler::new();
        asm.push(&ProviderEvent::Text("half".into()));
        asm.push(&chunk(0, Some("a"), Some("get_state"), "{"));
        let response = asm.abort();
        assert_eq!(response.text, "half");
        assert!(response.native_calls.is_empty());
        assert_eq!(response.stop, StopReason::Aborted);
    }
}
