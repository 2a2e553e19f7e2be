//! Core conversation types (provider-agnostic).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use storage::Role;

/// A stable message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What produced a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Authored by the user, the model or a tool.
    #[default]
    Normal,
    /// Condensed history written by compaction.
    Summary,
    /// Tool reinstruction injected on compaction.
    Reinstruction,
    /// Runtime notice to the model (e.g. tools disabled).
    Notice,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response.
    EndTurn,
    /// Model wants to call tools.
    ToolUse,
    /// Hit token limit.
    MaxTokens,
    /// The turn was cancelled before it completed.
    Aborted,
    /// The provider reported an error mid-response.
    Error(String),
    /// Unknown reason (forward compatibility).
    Other(String),
}

impl StopReason {
    /// Whether the turn ended without completing.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Aborted | Self::Error(_))
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndTurn => write!(f, "end_turn"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::MaxTokens => write!(f, "max_tokens"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error(detail) => write!(f, "error: {detail}"),
            Self::Other(other) => write!(f, "{other}"),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call (used to correlate results).
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON mapping.
    pub arguments: Map<String, Value>,
    /// The payload the call was detected from.
    pub raw: String,
    /// Set when the provider sent arguments that are not a JSON mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_error: Option<String>,
}

impl ToolCall {
    /// Create a call with well-formed arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        let raw = Value::Object(arguments.clone()).to_string();
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            raw,
            argument_error: None,
        }
    }

    /// Arguments as a JSON value.
    pub fn input(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// Outcome status of a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Result of a tool execution, paired with its call ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the tool call this result corresponds to.
    pub call_id: String,
    /// Output text (or a structured error payload).
    pub content: String,
    pub status: ToolStatus,
    /// Whether `content` was capped.
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    /// Create a successful result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            status: ToolStatus::Ok,
            truncated: false,
        }
    }

    /// Create an error result.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            status: ToolStatus::Error,
            truncated: false,
        }
    }

    /// Whether this is an error.
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Calls requested by an assistant message, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The result carried by a tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    #[serde(default)]
    pub kind: MessageKind,
    /// Provider stop reason of an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopReason>,
}

impl Message {
    /// Create a message with a role and text content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
            kind: MessageKind::Normal,
            stop: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message with text.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool message carrying one result.
    pub fn tool(result: ToolResult) -> Self {
        Self {
            tool_result: Some(result),
            ..Self::new(Role::Tool, String::new())
        }
    }

    /// Set the message kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the stop reason.
    pub fn with_stop(mut self, stop: StopReason) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Whether this message opens a new user turn.
    pub fn starts_turn(&self) -> bool {
        self.role == Role::User && self.kind == MessageKind::Normal
    }

    /// Whether this is an assistant message with tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    /// Size in characters, used for context estimates.
    pub fn char_len(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.len() + c.raw.chars().count())
            .sum();
        let result = self
            .tool_result
            .as_ref()
            .map_or(0, |r| r.content.chars().count());
        self.content.chars().count() + calls + result
    }
}

/// Tool specification exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for input parameters.
    pub schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    /// Field names listed in the schema's `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// First line of the description, capped for listings.
    pub fn brief(&self) -> String {
        let line = self.description.lines().next().unwrap_or("").trim();
        if line.chars().count() > 120 {
            let cut: String = line.chars().take(117).collect();
            format!("{cut}...")
        } else {
            line.to_string()
        }
    }
}

/// How the model should choose tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides whether to use tools.
    #[default]
    Auto,
    /// Model cannot use tools (even if provided).
    None,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn message_serde_round_trip_keeps_calls() {
        let call = ToolCall::new("call_1", "get_state", args(json!({"entity_id": "light.kitchen"})));
        let msg = Message::assistant_with_calls("checking", vec![call.clone()])
            .with_stop(StopReason::ToolUse);

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["stop"]["type"], "tool_use");

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.tool_calls, vec![call]);
        assert_eq!(back.kind, MessageKind::Normal);
    }

    #[test]
    fn error_stop_reason_carries_detail() {
        let value = serde_json::to_value(StopReason::Error("overloaded".into())).unwrap();
        assert_eq!(value, json!({"type": "error", "detail": "overloaded"}));
        assert!(StopReason::Aborted.is_interrupted());
        assert!(!StopReason::EndTurn.is_interrupted());
    }

    #[test]
    fn turn_start_excludes_synthetic_user_messages() {
        assert!(Message::user("hi").starts_turn());
        assert!(!Message::user("summary").with_kind(MessageKind::Summary).starts_turn());
        assert!(!Message::assistant("hello").starts_turn());
    }

    #[test]
    fn char_len_counts_calls_and_results() {
        let call = ToolCall::new("c", "ab", Map::new());
        let msg = Message::assistant_with_calls("xyz", vec![call]);
        assert_eq!(msg.char_len(), 3 + 2 + 2);

        let tool = Message::tool(ToolResult::ok("c", "1234"));
        assert_eq!(tool.char_len(), 4);
    }

    #[test]
    fn required_fields_from_schema() {
        let spec = ToolSpec::new(
            "get_state",
            "Read an entity state.\nMore detail.",
            json!({"type": "object", "required": ["entity_id"]}),
        );
        assert_eq!(spec.required_fields(), vec!["entity_id"]);
        assert_eq!(spec.brief(), "Read an entity state.");
    }
}
