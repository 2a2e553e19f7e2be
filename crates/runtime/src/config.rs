//! Runtime configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Loop, executor, compaction and retry settings.
///
/// Every field has a default, so an empty `[runtime]` table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Model requests per user query before tools are disabled.
    pub max_iterations: u32,
    /// Occurrence of an identical call that gets blocked (2 = the second).
    pub repeat_threshold: u32,
    /// Cap on tool output stored in history, in characters.
    pub max_tool_output_chars: usize,
    /// Per-invocation tool timeout.
    pub tool_timeout_secs: u64,
    /// What to do when a session is already running a query.
    pub on_busy: BusyPolicy,
    /// System prompt placed at the start of new sessions.
    pub system_prompt: Option<String>,
    /// Session histories kept in memory between queries; 0 disables the cache.
    pub max_cached_sessions: usize,
    pub context: ContextConfig,
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            repeat_threshold: 2,
            max_tool_output_chars: 30_000,
            tool_timeout_secs: 60,
            on_busy: BusyPolicy::Queue,
            system_prompt: None,
            max_cached_sessions: 64,
            context: ContextConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Behaviour for a second concurrent request on the same session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running query to finish.
    #[default]
    Queue,
    /// Fail with `Error::SessionBusy`.
    Reject,
}

/// Context budget and compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Model context window, in tokens.
    pub max_context_tokens: usize,
    /// Fraction of the window at which compaction triggers.
    pub compaction_threshold: f64,
    /// Tokens kept free for the model's reply.
    pub reserved_output_tokens: usize,
    /// Most recent user turns kept verbatim.
    pub keep_recent_turns: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 100_000,
            compaction_threshold: 0.8,
            reserved_output_tokens: 4_096,
            keep_recent_turns: 4,
        }
    }
}

impl ContextConfig {
    /// Token estimate above which compaction runs.
    pub fn effective_ceiling(&self) -> usize {
        let scaled = (self.max_context_tokens as f64 * self.compaction_threshold) as usize;
        scaled.saturating_sub(self.reserved_output_tokens)
    }
}

/// Provider transport retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// Smallest cap that still leaves room for a head and a tail.
const MIN_OUTPUT_CAP: usize = 64;

impl RuntimeConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        if self.repeat_threshold < 2 {
            return Err(Error::Config("repeat_threshold must be at least 2".into()));
        }
        if self.max_tool_output_chars < MIN_OUTPUT_CAP {
            return Err(Error::Config(format!(
                "max_tool_output_chars must be at least {MIN_OUTPUT_CAP}"
            )));
        }
        if self.tool_timeout_secs == 0 {
            return Err(Error::Config("tool_timeout_secs must be at least 1".into()));
        }
        let ctx = &self.context;
        if !(ctx.compaction_threshold > 0.0 && ctx.compaction_threshold <= 1.0) {
            return Err(Error::Config(
                "context.compaction_threshold must be in (0, 1]".into(),
            ));
        }
        if ctx.effective_ceiling() == 0 {
            return Err(Error::Config(
                "context budget leaves no room below reserved_output_tokens".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
