//! Tool registry trait and allow-list.

use crate::model::{ToolCall, ToolSpec};
use crate::tools::ToolError;
use policy::Policy;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use tracing::debug;

/// Trait for tool registries.
///
/// Implementations provide tool specifications and invoke tool calls.
/// This is the boundary between the model loop and side effects; the
/// runtime validates every call before `invoke` sees it.
pub trait ToolRegistry: Send + Sync {
    /// Get available tool specifications.
    fn specs(&self) -> &[ToolSpec];

    /// Look up the schema of a tool by name.
    fn get_tool_schema(&self, name: &str) -> Option<&ToolSpec> {
        self.specs().iter().find(|spec| spec.name == name)
    }

    /// Invoke a validated tool call.
    fn invoke(&self, call: &ToolCall) -> impl Future<Output = Result<Value, ToolError>> + Send;
}

/// A registry with no tools.
#[derive(Debug, Default)]
pub struct EmptyRegistry;

impl ToolRegistry for EmptyRegistry {
    fn specs(&self) -> &[ToolSpec] {
        &[]
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError> {
        Err(ToolError::UnknownTool {
            tool: call.name.clone(),
        })
    }
}

/// Snapshot of the tool names the model may call right now.
///
/// Registered tools intersected with the tool policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolAllowList {
    names: BTreeSet<String>,
}

impl ToolAllowList {
    /// Build from explicit names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Registered tools that the policy allows.
    pub fn from_registry<R: ToolRegistry + ?Sized>(registry: &R, policy: &Policy) -> Self {
        let names = registry
            .specs()
            .iter()
            .filter(|spec| {
                let allowed = policy.allows(&spec.name);
                if !allowed {
                    debug!(tool = %spec.name, "tool hidden by policy");
                }
                allowed
            })
            .map(|spec| spec.name.clone())
            .collect();
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Specs of the allowed tools, in registry order.
    pub fn filter_specs(&self, specs: &[ToolSpec]) -> Vec<ToolSpec> {
        specs
            .iter()
            .filter(|spec| self.contains(&spec.name))
            .cloned()
            .collect()
    }
}
