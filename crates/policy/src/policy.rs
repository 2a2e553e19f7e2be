//! Policy configuration and enforcement.

use crate::{Error, Result, ToolPattern};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Policy configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Rules for which tools the model may call.
    #[serde(default)]
    pub tools: ToolRules,
}

/// Allow and deny rules for tool names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRules {
    /// Tool name patterns that are allowed.
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,

    /// Tool name patterns that are denied (overrides allow).
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for ToolRules {
    fn default() -> Self {
        Self {
            allow: default_allow(),
            deny: Vec::new(),
        }
    }
}

fn default_allow() -> Vec<String> {
    vec!["*".to_string()]
}

/// Result of a policy check.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl Policy {
    /// Load policy from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse policy from TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let policy: Self = toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Allow every tool.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Deny every tool.
    pub fn restrictive() -> Self {
        Self {
            tools: ToolRules {
                allow: Vec::new(),
                deny: vec!["*".to_string()],
            },
        }
    }

    /// Check that every pattern parses.
    pub fn validate(&self) -> Result<()> {
        for pattern in self.tools.allow.iter().chain(&self.tools.deny) {
            ToolPattern::parse(pattern)?;
        }
        Ok(())
    }

    /// Check whether a tool may be called.
    pub fn check(&self, tool: &str) -> Decision {
        // Explicit denials first
        if let Some(pattern) = first_match(&self.tools.deny, tool) {
            debug!(tool, %pattern, "tool denied by policy");
            return Decision::Deny {
                reason: format!("tool '{tool}' is denied by policy ({pattern})"),
            };
        }

        if first_match(&self.tools.allow, tool).is_some() {
            Decision::Allow
        } else {
            Decision::Deny {
                reason: format!("tool '{tool}' is not in the allowlist"),
            }
        }
    }

    /// Shorthand for `check(tool).is_allowed()`.
    pub fn allows(&self, tool: &str) -> bool {
        self.check(tool).is_allowed()
    }
}

// Invalid patterns never match; `validate` reports them.
fn first_match(patterns: &[String], tool: &str) -> Option<ToolPattern> {
    patterns
        .iter()
        .filter_map(|p| ToolPattern::parse(p).ok())
        .find(|p| p.matches(tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrictive_denies_everything() {
        let policy = Policy::restrictive();
        assert!(!policy.allows("get_state"));
    }

    #[test]
    fn test_default_allows_everything() {
        let policy = Policy::permissive();
        assert!(policy.allows("get_state"));
        assert!(policy.allows("turn_on_light"));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[tools]
allow = ["get_*", "turn_on_light"]
deny = ["get_secret"]
"#;
        let policy = Policy::parse(toml).unwrap();

        // Allowed
        assert!(policy.allows("get_state"));
        assert!(policy.allows("turn_on_light"));

        // Denied
        assert!(!policy.allows("get_secret"));
        assert!(!policy.allows("turn_off_light"));
    }

    #[test]
    fn test_missing_tools_table_is_permissive() {
        let policy = Policy::parse("").unwrap();
        assert!(policy.allows("anything"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = Policy::parse("[tools]\nallow = [\"a*b\"]\n").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_deny_reason_names_pattern() {
        let policy = Policy::parse("[tools]\ndeny = [\"shell_*\"]\n").unwrap();
        match policy.check("shell_exec") {
            Decision::Deny { reason } => assert!(reason.contains("shell_*")),
            Decision::Allow => panic!("expected deny"),
        }
    }
}
