use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during tool execution.
///
/// These never abort the loop: they are rendered into error tool results
/// so the model can react to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ToolError {
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("tool '{tool}' denied: {reason}")]
    Denied { tool: String, reason: String },

    #[error("malformed arguments for '{tool}': {reason}")]
    MalformedArguments {
        tool: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing: Vec<String>,
    },

    #[error("repeated call to '{tool}' blocked: {count} identical calls this turn")]
    RepeatedCall { tool: String, count: u32 },

    #[error("no result for call {call_id}: {reason}")]
    MissingResult { call_id: String, reason: String },

    #[error("tool '{tool}' timed out after {millis}ms")]
    Timeout { tool: String, millis: u64 },

    #[error("execution failed: {message}")]
    Execution { message: String },
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Structured payload returned to the model.
    pub fn payload(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Value::Object(map) = &mut value {
            map.insert("message".into(), Value::String(self.to_string()));
        }
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_json() {
        let err = ToolError::MalformedArguments {
            tool: "get_state".into(),
            reason: "missing required arguments".into(),
            missing: vec!["entity_id".into()],
        };
        let payload: Value = serde_json::from_str(&err.payload()).unwrap();
        assert_eq!(payload["error"], "malformed_arguments");
        assert_eq!(payload["missing"][0], "entity_id");
        assert!(payload["message"].as_str().unwrap().contains("get_state"));
    }

    #[test]
    fn repeated_call_message() {
        let err = ToolError::RepeatedCall {
            tool: "search".into(),
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "repeated call to 'search' blocked: 2 identical calls this turn"
        );
    }
}
