//! Repeated-call circuit breaker.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Counts normalized calls within one user query.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    seen: HashMap<[u8; 32], u32>,
}

/// Outcome of recording a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Blocked; carries how many identical calls were seen, including this one.
    Block(u32),
}

impl CircuitBreaker {
    /// `threshold` is the occurrence that gets blocked.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(2),
            seen: HashMap::new(),
        }
    }

    /// Record a call and decide whether it may run.
    pub fn check(&mut self, name: &str, arguments: &Map<String, Value>) -> Verdict {
        let count = self.seen.entry(call_hash(name, arguments)).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            Verdict::Block(*count)
        } else {
            Verdict::Allow
        }
    }
}

fn is_identifier_key(key: &str) -> bool {
    key == "id"
        || key == "name"
        || key.ends_with("_id")
        || key.ends_with("_ids")
        || key.ends_with("_name")
}

fn normalize(value: &Value, identifier: bool) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            Value::String(if identifier {
                trimmed.to_lowercase()
            } else {
                trimmed.to_string()
            })
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, identifier)).collect()),
        Value::Object(map) => normalize_map(map),
        other => other.clone(),
    }
}

// Keys sorted, values normalized.
fn normalize_map(map: &Map<String, Value>) -> Value {
    let sorted: BTreeMap<&String, Value> = map
        .iter()
        .map(|(k, v)| (k, normalize(v, is_identifier_key(k))))
        .collect();
    let mut out = Map::new();
    for (k, v) in sorted {
        out.insert(k.clone(), v);
    }
    Value::Object(out)
}

/// SHA-256 over the tool name and the canonical normalized arguments.
pub fn call_hash(name: &str, arguments: &Map<String, Value>) -> [u8; 32] {
    let canonical = normalize_map(arguments).to_string();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn second_identical_call_is_blocked() {
        let mut breaker = CircuitBreaker::new(2);
        let a = args(json!({"entity_id": "light.kitchen"}));
        assert_eq!(breaker.check("get_state", &a), Verdict::Allow);
        assert_eq!(breaker.check("get_state", &a), Verdict::Block(2));
        assert_eq!(breaker.check("get_state", &a), Verdict::Block(3));
    }

    #[test]
    fn normalization_folds_identifiers_and_whitespace() {
        let a = args(json!({"entity_id": " Light.Kitchen ", "query": "  Hello "}));
        let b = args(json!({"query": "Hello", "entity_id": "light.kitchen"}));
        assert_eq!(call_hash("get_state", &a), call_hash("get_state", &b));
    }

    #[test]
    fn free_text_case_is_preserved() {
        let a = args(json!({"query": "Hello"}));
        let b = args(json!({"query": "hello"}));
        assert_ne!(call_hash("search", &a), call_hash("search", &b));
    }

    #[test]
    fn nested_identifier_arrays_are_folded() {
        let a = args(json!({"target": {"device_ids": ["A", "B"]}}));
        let b = args(json!({"target": {"device_ids": ["a", "b"]}}));
        assert_eq!(call_hash("turn_on", &a), call_hash("turn_on", &b));
    }

    #[test]
    fn tool_name_is_part_of_the_key() {
        let mut breaker = CircuitBreaker::new(2);
        let a = args(json!({}));
        assert_eq!(breaker.check("get_state", &a), Verdict::Allow);
        assert_eq!(breaker.check("list_states", &a), Verdict::Allow);
        assert_eq!(breaker.check("get_state", &a), Verdict::Block(2));
    }
}
