//! Tool execution.
//!
//! Every call passes validation (allow-list, argument shape, required
//! fields) and the circuit breaker before it reaches the registry. Failures
//! of any kind become error [`ToolResult`]s for the model; nothing here
//! aborts the loop.

mod breaker;
mod truncate;

pub use breaker::{CircuitBreaker, Verdict, call_hash};
pub use truncate::cap_output;

use crate::config::RuntimeConfig;
use crate::model::{ToolCall, ToolResult, ToolStatus};
use crate::tools::{ToolAllowList, ToolError, ToolRegistry};
use futures_util::future::join_all;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Executes validated tool calls against a registry.
pub struct Executor<'a, R: ?Sized> {
    registry: &'a R,
    allow: &'a ToolAllowList,
    max_output_chars: usize,
    timeout: Duration,
}

impl<'a, R: ToolRegistry + ?Sized> Executor<'a, R> {
    pub fn new(registry: &'a R, allow: &'a ToolAllowList, config: &RuntimeConfig) -> Self {
        Self {
            registry,
            allow,
            max_output_chars: config.max_tool_output_chars,
            timeout: config.tool_timeout(),
        }
    }

    /// Execute one call.
    pub async fn execute(&self, call: &ToolCall, breaker: &mut CircuitBreaker) -> ToolResult {
        let mut results = self.execute_batch(std::slice::from_ref(call), breaker).await;
        results
            .pop()
            .unwrap_or_else(|| self.error_result(call, ToolError::execution("no result produced")))
    }

    /// Execute the calls of one assistant turn.
    ///
    /// Validation and breaker checks run in declaration order; admitted
    /// calls then run concurrently. Results come back in declaration order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        breaker: &mut CircuitBreaker,
    ) -> Vec<ToolResult> {
        let mut slots: Vec<Option<ToolResult>> = Vec::with_capacity(calls.len());
        let mut admitted = Vec::new();

        for (index, call) in calls.iter().enumerate() {
            match self.admit(call, breaker) {
                Ok(()) => {
                    slots.push(None);
                    admitted.push(index);
                }
                Err(err) => {
                    warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call refused");
                    slots.push(Some(self.error_result(call, err)));
                }
            }
        }

        let outputs = join_all(admitted.iter().map(|&index| self.run(&calls[index]))).await;
        for (index, result) in admitted.into_iter().zip(outputs) {
            slots[index] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }

    fn admit(&self, call: &ToolCall, breaker: &mut CircuitBreaker) -> Result<(), ToolError> {
        let spec = self.registry.get_tool_schema(&call.name);
        if !self.allow.contains(&call.name) {
            return Err(match spec {
                Some(_) => ToolError::Denied {
                    tool: call.name.clone(),
                    reason: "blocked by tool policy".into(),
                },
                None => ToolError::UnknownTool {
                    tool: call.name.clone(),
                },
            });
        }
        let Some(spec) = spec else {
            return Err(ToolError::UnknownTool {
                tool: call.name.clone(),
            });
        };

        if let Some(reason) = &call.argument_error {
            return Err(ToolError::MalformedArguments {
                tool: call.name.clone(),
                reason: reason.clone(),
                missing: Vec::new(),
            });
        }
        let missing: Vec<String> = spec
            .required_fields()
            .into_iter()
            .filter(|field| !call.arguments.contains_key(*field))
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::MalformedArguments {
                tool: call.name.clone(),
                reason: format!("missing required arguments: {}", missing.join(", ")),
                missing,
            });
        }

        match breaker.check(&call.name, &call.arguments) {
            Verdict::Allow => Ok(()),
            Verdict::Block(count) => Err(ToolError::RepeatedCall {
                tool: call.name.clone(),
                count,
            }),
        }
    }

    async fn run(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        debug!(tool = %call.name, call_id = %call.id, "invoking tool");

        let outcome = tokio::time::timeout(self.timeout, self.registry.invoke(call)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                let (content, truncated) = cap_output(&text, self.max_output_chars);
                if truncated {
                    info!(tool = %call.name, call_id = %call.id, "tool output capped");
                }
                info!(tool = %call.name, call_id = %call.id, elapsed_ms, "tool finished");
                ToolResult {
                    call_id: call.id.clone(),
                    content,
                    status: ToolStatus::Ok,
                    truncated,
                }
            }
            Ok(Err(err)) => {
                warn!(tool = %call.name, call_id = %call.id, elapsed_ms, error = %err, "tool failed");
                self.error_result(call, err)
            }
            Err(_) => {
                let millis = self.timeout.as_millis() as u64;
                warn!(tool = %call.name, call_id = %call.id, millis, "tool timed out");
                self.error_result(
                    call,
                    ToolError::Timeout {
                        tool: call.name.clone(),
                        millis,
                    },
                )
            }
        }
    }

    fn error_result(&self, call: &ToolCall, err: ToolError) -> ToolResult {
        let (content, truncated) = cap_output(&err.payload(), self.max_output_chars);
        ToolResult {
            call_id: call.id.clone(),
            content,
            status: ToolStatus::Error,
            truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Behaviour, RecordingRegistry};
    use serde_json::json;

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall::new(id, name, args.as_object().cloned().unwrap())
    }

    fn registry() -> RecordingRegistry {
        RecordingRegistry::new()
            .with_tool(
                "get_state",
                json!({"type": "object", "required": ["entity_id"]}),
                Behaviour::Reply(json!({"state": "on"})),
            )
            .with_tool("echo", json!({"type": "object"}), Behaviour::Echo)
            .with_tool("slow", json!({"type": "object"}), Behaviour::Delayed(Duration::from_secs(5), Value::Null))
            .with_tool("broken", json!({"type": "object"}), Behaviour::Fail("disk full".into()))
    }

    fn payload(result: &ToolResult) -> Value {
        serde_json::from_str(&result.content).unwrap()
    }

    #[tokio::test]
    async fn unknown_tool_is_never_invoked() {
        let registry = registry();
        let allow = ToolAllowList::new(["get_state"]);
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let result = executor
            .execute(&call("c1", "turn_on_light", json!({})), &mut breaker)
            .await;
        assert!(result.is_error());
        assert_eq!(payload(&result)["error"], "unknown_tool");
        assert!(registry.invocations().is_empty());
    }

    #[tokio::test]
    async fn policy_denied_tool_is_reported_as_denied() {
        let registry = registry();
        let allow = ToolAllowList::new(["get_state"]);
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let result = executor.execute(&call("c1", "echo", json!({})), &mut breaker).await;
        assert_eq!(payload(&result)["error"], "denied");
        assert!(registry.invocations().is_empty());
    }

    #[tokio::test]
    async fn missing_required_field_is_malformed() {
        let registry = registry();
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let result = executor
            .execute(&call("c1", "get_state", json!({})), &mut breaker)
            .await;
        let body = payload(&result);
        assert_eq!(body["error"], "malformed_arguments");
        assert_eq!(body["missing"], json!(["entity_id"]));
        assert!(registry.invocations().is_empty());
    }

    #[tokio::test]
    async fn argument_error_is_malformed() {
        let registry = registry();
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let mut bad = call("c1", "echo", json!({}));
        bad.argument_error = Some("arguments must be a JSON object".into());
        let result = executor.execute(&bad, &mut breaker).await;
        assert_eq!(payload(&result)["error"], "malformed_arguments");
        assert!(registry.invocations().is_empty());
    }

    #[tokio::test]
    async fn second_identical_call_is_not_executed() {
        let registry = registry();
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let first = executor
            .execute(&call("c1", "get_state", json!({"entity_id": "light.a"})), &mut breaker)
            .await;
        let second = executor
            .execute(&call("c2", "get_state", json!({"entity_id": " LIGHT.A "})), &mut breaker)
            .await;

        assert!(!first.is_error());
        assert_eq!(payload(&second)["error"], "repeated_call");
        assert_eq!(registry.invocations().len(), 1);
    }

    #[tokio::test]
    async fn batch_results_keep_declaration_order() {
        let registry = RecordingRegistry::new()
            .with_tool(
                "late",
                json!({"type": "object"}),
                Behaviour::Delayed(Duration::from_millis(50), json!("late")),
            )
            .with_tool("early", json!({"type": "object"}), Behaviour::Reply(json!("early")));
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let calls = vec![
            call("a", "late", json!({})),
            call("b", "missing", json!({})),
            call("c", "early", json!({})),
        ];
        let results = executor.execute_batch(&calls, &mut breaker).await;
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(results[0].content, "late");
        assert!(results[1].is_error());
        assert_eq!(results[2].content, "early");
    }

    #[tokio::test]
    async fn batch_calls_run_concurrently() {
        let registry = RecordingRegistry::new().with_tool(
            "wait",
            json!({"type": "object"}),
            Behaviour::Delayed(Duration::from_millis(150), json!("done")),
        );
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let executor = Executor::new(&registry, &allow, &RuntimeConfig::default());
        let mut breaker = CircuitBreaker::new(2);

        let calls = vec![
            call("a", "wait", json!({"n": 1})),
            call("b", "wait", json!({"n": 2})),
        ];
        let started = std::time::Instant::now();
        let results = executor.execute_batch(&calls, &mut breaker).await;
        let elapsed = started.elapsed();

        assert!(results.iter().all(|r| !r.is_error()));
        assert_eq!(registry.invocations().len(), 2);
        // Sequential dispatch would take at least 300ms.
        assert!(elapsed < Duration::from_millis(280), "batch took {elapsed:?}");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let registry = registry();
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let config = RuntimeConfig {
            max_tool_output_chars: 30_000,
            ..Default::default()
        };
        let executor = Executor::new(&registry, &allow, &config);
        let mut breaker = CircuitBreaker::new(2);

        let big = "x".repeat(50_000);
        let result = executor
            .execute(&call("c1", "echo", json!({"text": big})), &mut breaker)
            .await;
        assert!(result.truncated);
        assert!(result.content.contains("characters omitted"));
        assert!(result.content.chars().count() < 30_100);
    }

    #[tokio::test]
    async fn failure_and_timeout_become_error_results() {
        let registry = registry();
        let allow = ToolAllowList::from_registry(&registry, &policy::Policy::permissive());
        let config = RuntimeConfig {
            tool_timeout_secs: 1,
            ..Default::default()
        };
        let executor = Executor::new(&registry, &allow, &config);
        let mut breaker = CircuitBreaker::new(2);

        let broken = executor.execute(&call("c1", "broken", json!({})), &mut breaker).await;
        assert_eq!(payload(&broken)["error"], "execution");

        let slow = executor.execute(&call("c2", "slow", json!({})), &mut breaker).await;
        assert_eq!(payload(&slow)["error"], "timeout");
    }
}
