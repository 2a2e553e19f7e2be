use crate::{Error, Result};
use std::fmt;

/// A parsed tool-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPattern {
    /// `*`: every tool.
    Any,
    /// `prefix*`: tools whose name starts with the prefix.
    Prefix(String),
    /// An exact tool name.
    Exact(String),
}

impl ToolPattern {
    /// Parse a pattern string.
    ///
    /// A `*` is only accepted as the whole pattern or as its last character.
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::Invalid("empty tool pattern".into()));
        }
        if pattern == "*" {
            return Ok(Self::Any);
        }
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => Err(Error::Invalid(format!(
                "wildcard only allowed at the end of a pattern: {pattern}"
            ))),
            Some(prefix) => Ok(Self::Prefix(prefix.to_string())),
            None if pattern.contains('*') => Err(Error::Invalid(format!(
                "wildcard only allowed at the end of a pattern: {pattern}"
            ))),
            None => Ok(Self::Exact(pattern.to_string())),
        }
    }

    /// Whether the pattern matches a tool name.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Self::Exact(exact) => name == exact,
        }
    }
}

impl fmt::Display for ToolPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Exact(exact) => write!(f, "{exact}"),
        }
    }
}
