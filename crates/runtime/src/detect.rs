//! Tool-call detection.
//!
//! Native tool-call blocks are used exclusively when present. Text scanning
//! is a fallback for providers without native tool calling and only accepts
//! a strict `{"tool": ..., "arguments": {...}}` shape naming an allowed tool.

use crate::model::ToolCall;
use crate::provider::{AssembledResponse, NativeCall};
use crate::tools::ToolAllowList;
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const NAME_FIELDS: &[&str] = &["name", "tool", "tool_name"];
const ARGUMENT_FIELDS: &[&str] = &["arguments", "parameters", "args", "input"];

/// Why a candidate was not turned into a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("native call without a tool name")]
    EmptyName,
    #[error("not valid JSON: {0}")]
    NotJson(String),
    #[error("no tool name field")]
    MissingName,
    #[error("no arguments field")]
    MissingArguments,
    #[error("more than one {0} field")]
    Ambiguous(&'static str),
    #[error("tool name is not a non-empty string")]
    InvalidName,
    #[error("arguments are not a JSON object")]
    ArgumentsNotObject,
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

/// A rejected candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub candidate: String,
    pub reason: RejectReason,
}

/// Calls and rejections from one response.
#[derive(Debug, Default)]
pub struct Detection {
    pub calls: Vec<ToolCall>,
    pub rejections: Vec<Rejection>,
}

/// Extracts tool calls and allocates call ids for one user query.
///
/// Ids have the form `call_<prefix>_<seq>`; the prefix is unique per
/// detector and `seq` only grows. Provider ids that collide with an id
/// allocated or [reserved](Self::reserve) earlier are replaced.
#[derive(Debug)]
pub struct Detector {
    prefix: String,
    seq: u64,
    allocated: HashSet<String>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        let prefix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: 0,
            allocated: HashSet::new(),
        }
    }

    /// Mark ids already present in the session so they are never reused.
    pub fn reserve<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allocated.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Allocate a fresh call id.
    pub fn next_id(&mut self) -> String {
        loop {
            self.seq += 1;
            let id = format!("call_{}_{}", self.prefix, self.seq);
            if self.allocated.insert(id.clone()) {
                return id;
            }
        }
    }

    // Keep a provider id unless it collides with one already handed out.
    fn claim_id(&mut self, provided: Option<&str>) -> String {
        match provided {
            Some(id) if !id.is_empty() => {
                if self.allocated.insert(id.to_string()) {
                    id.to_string()
                } else {
                    let fresh = self.next_id();
                    warn!(provided = id, assigned = %fresh, "duplicate tool call id reassigned");
                    fresh
                }
            }
            _ => self.next_id(),
        }
    }

    /// Detect tool calls in an assembled response.
    pub fn detect(
        &mut self,
        response: &AssembledResponse,
        supports_native: bool,
        allow: &ToolAllowList,
    ) -> Detection {
        let detection = if !response.native_calls.is_empty() {
            self.detect_native(&response.native_calls)
        } else if !supports_native {
            self.detect_text(&response.text, allow)
        } else {
            Detection::default()
        };

        for rejection in &detection.rejections {
            match rejection.reason {
                RejectReason::NotJson(_) => {
                    debug!(reason = %rejection.reason, "ignoring non-JSON braces in text")
                }
                _ => warn!(
                    reason = %rejection.reason,
                    candidate = %rejection.candidate,
                    "tool call candidate rejected"
                ),
            }
        }
        detection
    }

    fn detect_native(&mut self, native: &[NativeCall]) -> Detection {
        let mut detection = Detection::default();
        for call in native {
            let name = call.name.trim();
            if name.is_empty() {
                detection.rejections.push(Rejection {
                    candidate: call.arguments.clone(),
                    reason: RejectReason::EmptyName,
                });
                continue;
            }
            let id = self.claim_id(call.id.as_deref());
            let raw = if call.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                call.arguments.clone()
            };
            let (arguments, argument_error) = match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => (map, None),
                Ok(_) => (Map::new(), Some("arguments must be a JSON object".to_string())),
                Err(err) => (Map::new(), Some(format!("arguments are not valid JSON: {err}"))),
            };
            detection.calls.push(ToolCall {
                id,
                name: name.to_string(),
                arguments,
                raw,
                argument_error,
            });
        }
        detection
    }

    fn detect_text(&mut self, text: &str, allow: &ToolAllowList) -> Detection {
        let mut detection = Detection::default();
        for candidate in json_candidates(text) {
            match parse_candidate(candidate, allow) {
                Ok((name, arguments)) => {
                    let id = self.next_id();
                    detection.calls.push(ToolCall {
                        id,
                        name,
                        arguments,
                        raw: candidate.to_string(),
                        argument_error: None,
                    });
                }
                Err(reason) => detection.rejections.push(Rejection {
                    candidate: candidate.to_string(),
                    reason,
                }),
            }
        }
        detection
    }
}

fn parse_candidate(
    candidate: &str,
    allow: &ToolAllowList,
) -> Result<(String, Map<String, Value>), RejectReason> {
    let value: Value =
        serde_json::from_str(candidate).map_err(|e| RejectReason::NotJson(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(RejectReason::MissingName);
    };

    let name_key = single_field(&object, NAME_FIELDS, "name")?.ok_or(RejectReason::MissingName)?;
    let args_key =
        single_field(&object, ARGUMENT_FIELDS, "arguments")?.ok_or(RejectReason::MissingArguments)?;

    let name = match object.remove(name_key) {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return Err(RejectReason::InvalidName),
    };
    let Some(Value::Object(arguments)) = object.remove(args_key) else {
        return Err(RejectReason::ArgumentsNotObject);
    };
    if !allow.contains(&name) {
        return Err(RejectReason::UnknownTool(name));
    }
    Ok((name, arguments))
}

fn single_field(
    object: &Map<String, Value>,
    fields: &'static [&'static str],
    what: &'static str,
) -> Result<Option<&'static str>, RejectReason> {
    let mut present = fields.iter().copied().filter(|f| object.contains_key(*f));
    let first = present.next();
    if present.next().is_some() {
        return Err(RejectReason::Ambiguous(what));
    }
    Ok(first)
}

/// Top-level balanced `{...}` spans in `text`.
///
/// Braces inside JSON string literals are ignored. An opening brace that is
/// never closed is skipped and scanning resumes after it.
fn json_candidates(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        match balanced_len(&text[start..]) {
            Some(len) => {
                out.push(&text[start..start + len]);
                pos = start + len;
            }
            None => pos = start + 1,
        }
    }
    out
}

// Byte length of the object opening at the start of `s`, if it closes.
fn balanced_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StopReason, Usage};

    fn allow() -> ToolAllowList {
        ToolAllowList::new(["get_state"])
    }

    fn text_response(text: &str) -> AssembledResponse {
        AssembledResponse {
            text: text.into(),
            native_calls: Vec::new(),
            stop: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }

    fn native(id: Option<&str>, name: &str, arguments: &str) -> NativeCall {
        NativeCall {
            id: id.map(String::from),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[test]
    fn native_prose_json_is_not_a_call() {
        let mut detector = Detector::with_prefix("q");
        let response = text_response(
            "For example you could send {\"tool\": \"get_state\", \"arguments\": {\"entity_id\": \"x\"}}.",
        );
        let detection = detector.detect(&response, true, &allow());
        assert!(detection.calls.is_empty());
        assert!(detection.rejections.is_empty());
    }

    #[test]
    fn native_calls_win_over_text() {
        let mut detector = Detector::with_prefix("q");
        let mut response =
            text_response("{\"tool\": \"get_state\", \"arguments\": {\"entity_id\": \"text\"}}");
        response.native_calls = vec![native(Some("toolu_1"), "get_state", "{\"entity_id\":\"native\"}")];

        let detection = detector.detect(&response, false, &allow());
        assert_eq!(detection.calls.len(), 1);
        assert_eq!(detection.calls[0].id, "toolu_1");
        assert_eq!(detection.calls[0].arguments["entity_id"], "native");
    }

    #[test]
    fn text_fallback_accepts_allowed_tool() {
        let mut detector = Detector::with_prefix("q");
        let response = text_response(
            "Checking now.\n{\"tool\": \"get_state\", \"arguments\": {\"entity_id\": \"light.kitchen\"}}",
        );
        let detection = detector.detect(&response, false, &allow());
        assert_eq!(detection.calls.len(), 1);
        let call = &detection.calls[0];
        assert_eq!(call.id, "call_q_1");
        assert_eq!(call.name, "get_state");
        assert_eq!(call.arguments["entity_id"], "light.kitchen");
        assert!(call.raw.starts_with('{'));
    }

    #[test]
    fn unregistered_tool_in_text_is_rejected() {
        let mut detector = Detector::with_prefix("q");
        let response = text_response("{\"tool\":\"turn_on_light\",\"parameters\":{}}");
        let detection = detector.detect(&response, false, &allow());
        assert!(detection.calls.is_empty());
        assert_eq!(
            detection.rejections[0].reason,
            RejectReason::UnknownTool("turn_on_light".into())
        );
    }

    #[test]
    fn ambiguous_and_malformed_candidates_are_rejected() {
        let mut detector = Detector::with_prefix("q");
        let response = text_response(concat!(
            "{\"name\": \"get_state\", \"tool\": \"get_state\", \"arguments\": {}} ",
            "{\"tool\": \"get_state\", \"arguments\": \"entity_id=x\"} ",
            "{\"tool\": \"get_state\"} ",
            "{not json}",
        ));
        let detection = detector.detect(&response, false, &allow());
        assert!(detection.calls.is_empty());
        let reasons: Vec<_> = detection.rejections.iter().map(|r| r.reason.clone()).collect();
        assert_eq!(reasons[0], RejectReason::Ambiguous("name"));
        assert_eq!(reasons[1], RejectReason::ArgumentsNotObject);
        assert_eq!(reasons[2], RejectReason::MissingArguments);
        assert!(matches!(reasons[3], RejectReason::NotJson(_)));
    }

    #[test]
    fn braces_inside_strings_do_not_unbalance() {
        let text = r#"{"tool": "get_state", "arguments": {"entity_id": "a}b\"{"}}"#;
        assert_eq!(json_candidates(text), vec![text]);
    }

    #[test]
    fn unterminated_brace_is_skipped() {
        let text = r#"use { carefully {"tool": "get_state", "arguments": {}}"#;
        let candidates = json_candidates(text);
        assert_eq!(candidates, vec![r#"{"tool": "get_state", "arguments": {}}"#]);
    }

    #[test]
    fn native_arguments_edge_cases() {
        let mut detector = Detector::with_prefix("q");
        let mut response = text_response("");
        response.native_calls = vec![
            native(None, "get_state", ""),
            native(None, "get_state", "[1, 2]"),
            native(None, "get_state", "{\"entity_id\": "),
            native(None, "  ", "{}"),
        ];
        let detection = detector.detect(&response, true, &allow());
        assert_eq!(detection.calls.len(), 3);
        assert!(detection.calls[0].arguments.is_empty());
        assert!(detection.calls[0].argument_error.is_none());
        assert!(detection.calls[1].argument_error.is_some());
        assert!(detection.calls[2].argument_error.is_some());
        assert_eq!(detection.rejections[0].reason, RejectReason::EmptyName);
    }

    #[test]
    fn colliding_ids_are_reassigned() {
        let mut detector = Detector::with_prefix("q");
        let mut response = text_response("");
        response.native_calls = vec![
            native(Some("dup"), "get_state", "{}"),
            native(Some("dup"), "get_state", "{}"),
        ];
        let first = detector.detect(&response, true, &allow());
        assert_eq!(first.calls[0].id, "dup");
        assert_eq!(first.calls[1].id, "call_q_1");

        let second = detector.detect(&response, true, &allow());
        let ids: Vec<_> = second.calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call_q_2", "call_q_3"]);
    }

    #[test]
    fn reserved_ids_are_not_reused() {
        let mut detector = Detector::with_prefix("q").reserve(["call_0", "call_q_1"]);
        let mut response = text_response("");
        response.native_calls = vec![native(Some("call_0"), "get_state", "{}")];

        let detection = detector.detect(&response, true, &allow());
        assert_eq!(detection.calls[0].id, "call_q_2");
    }
}
