//! Tool policy.
//!
//! Core principle: **A tool the policy does not allow is a tool the model does not have.**
//!
//! Rules are name patterns: `*` matches every tool, `prefix*` matches by prefix,
//! anything else is an exact name. Deny rules override allow rules.

mod error;
mod policy;
mod rule;

pub use error::{Error, Result};
pub use policy::{Decision, Policy, ToolRules};
pub use rule::ToolPattern;
