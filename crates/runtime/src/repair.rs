//! History repair.
//!
//! Restores call/result pairing in a message sequence: every surviving tool
//! call is followed (before the next non-tool message) by exactly one result,
//! and every tool result answers a call from the assistant message directly
//! before it.

use crate::model::{Message, Role, StopReason, ToolResult};
use crate::tools::{ToolAllowList, ToolError};
use std::collections::HashSet;
use tracing::{debug, warn};

/// What a repair pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    /// Calls removed as unknown or as id collisions (`name` / `id`).
    pub dropped_calls: Vec<String>,
    /// Ids of tool results removed as orphans or duplicates.
    pub dropped_results: Vec<String>,
    /// Ids of calls that received a synthesized error result.
    pub synthesized: Vec<String>,
    /// Messages removed entirely.
    pub dropped_messages: usize,
}

impl RepairReport {
    /// Whether the pass changed nothing.
    pub fn is_clean(&self) -> bool {
        self.dropped_calls.is_empty()
            && self.dropped_results.is_empty()
            && self.synthesized.is_empty()
            && self.dropped_messages == 0
    }
}

struct Pending {
    ids: Vec<String>,
    stop: Option<StopReason>,
}

impl Pending {
    fn none() -> Self {
        Self {
            ids: Vec::new(),
            stop: None,
        }
    }

    fn take(&mut self, call_id: &str) -> bool {
        match self.ids.iter().position(|id| id == call_id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    // Error results for every call still waiting.
    fn flush(&mut self, out: &mut Vec<Message>, report: &mut RepairReport) {
        for call_id in self.ids.drain(..) {
            let reason = match &self.stop {
                Some(StopReason::Aborted) => "the turn was aborted before this call completed".to_string(),
                Some(StopReason::Error(detail)) => {
                    format!("the turn failed before this call completed: {detail}")
                }
                _ => "no result was recorded for this call".to_string(),
            };
            let err = ToolError::MissingResult {
                call_id: call_id.clone(),
                reason,
            };
            debug!(call_id = %call_id, "synthesizing missing tool result");
            out.push(Message::tool(ToolResult::error(&call_id, err.payload())));
            report.synthesized.push(call_id);
        }
        self.stop = None;
    }
}

/// Repair `messages` against the tools currently allowed.
pub fn repair(messages: Vec<Message>, allow: &ToolAllowList) -> (Vec<Message>, RepairReport) {
    let mut out = Vec::with_capacity(messages.len());
    let mut report = RepairReport::default();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut pending = Pending::none();

    for mut msg in messages {
        if msg.role == Role::Tool {
            let Some(call_id) = msg.tool_result.as_ref().map(|r| r.call_id.clone()) else {
                report.dropped_messages += 1;
                continue;
            };
            if pending.take(&call_id) {
                out.push(msg);
            } else {
                warn!(call_id = %call_id, "dropping orphaned tool result");
                report.dropped_results.push(call_id);
            }
            continue;
        }

        pending.flush(&mut out, &mut report);

        if msg.role == Role::Assistant {
            let calls = std::mem::take(&mut msg.tool_calls);
            for call in calls {
                if !allow.contains(&call.name) {
                    warn!(tool = %call.name, call_id = %call.id, "dropping call to unknown tool");
                    report.dropped_calls.push(format!("{}/{}", call.name, call.id));
                } else if !seen_ids.insert(call.id.clone()) {
                    warn!(call_id = %call.id, "dropping call with colliding id");
                    report.dropped_calls.push(format!("{}/{}", call.name, call.id));
                } else {
                    msg.tool_calls.push(call);
                }
            }
            if msg.content.trim().is_empty() && msg.tool_calls.is_empty() {
                report.dropped_messages += 1;
                continue;
            }
            pending = Pending {
                ids: msg.tool_calls.iter().map(|c| c.id.clone()).collect(),
                stop: msg.stop.clone().filter(StopReason::is_interrupted),
            };
        }
        out.push(msg);
    }
    pending.flush(&mut out, &mut report);

    if !report.is_clean() {
        debug!(
            dropped_calls = report.dropped_calls.len(),
            dropped_results = report.dropped_results.len(),
            synthesized = report.synthesized.len(),
            dropped_messages = report.dropped_messages,
            "history repaired"
        );
    }
    (out, report)
}

#[cfg(test)]
pub(crate) fn assert_paired(messages: &[Message]) {
    let mut pending: Vec<String> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::Tool => {
                let result = msg.tool_result.as_ref().expect("tool message without result");
                let pos = pending
                    .iter()
                    .position(|id| *id == result.call_id)
                    .unwrap_or_else(|| panic!("orphan result {}", result.call_id));
                pending.remove(pos);
            }
            _ => {
                assert!(pending.is_empty(), "calls without results: {pending:?}");
                pending = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
            }
        }
    }
    assert!(pending.is_empty(), "calls without results: {pending:?}");
}
