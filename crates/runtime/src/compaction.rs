//! Context compaction.
//!
//! When the history estimate passes the effective ceiling, everything
//! between the system message and the last `keep_recent_turns` user turns
//! is summarized into one message. Cuts fall on turn starts, so an
//! assistant message and its tool results always end up on the same side.
//! Every compaction also injects a reinstruction listing the available
//! tools.

use crate::config::{ContextConfig, RetryConfig};
use crate::history::History;
use crate::model::{Message, MessageKind, ModelError, Role, ToolChoice, ToolSpec};
use crate::provider::{Provider, ProviderRequest, ResponseAssembler, send_with_retry};
use crate::repair::{RepairReport, repair};
use crate::tools::ToolAllowList;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::ops::Range;
use tracing::{info, warn};

const SUMMARY_PROMPT: &str = "You condense conversations so they can continue without the original \
messages. Write a concise summary covering: what the user asked for, facts established by tool \
results, decisions made, and work still pending. Only report tool results that appear in the \
transcript; never invent them.";

const SUMMARY_HEADER: &str = "[Summary of earlier conversation]";

// Per-message cap when rendering a transcript for the summarizer.
const TRANSCRIPT_MESSAGE_CHARS: usize = 2_000;

/// Produces summaries of message spans.
pub trait Summarizer: Send + Sync {
    fn summarize(
        &self,
        messages: &[Message],
    ) -> impl Future<Output = Result<String, ModelError>> + Send;
}

/// Summarizes with the conversation's own provider, tools disabled.
pub struct ProviderSummarizer<'a, P> {
    provider: &'a P,
    retry: &'a RetryConfig,
}

impl<'a, P: Provider> ProviderSummarizer<'a, P> {
    pub fn new(provider: &'a P, retry: &'a RetryConfig) -> Self {
        Self { provider, retry }
    }
}

impl<P: Provider> Summarizer for ProviderSummarizer<'_, P> {
    async fn summarize(&self, messages: &[Message]) -> Result<String, ModelError> {
        let request_messages = vec![
            Message::system(SUMMARY_PROMPT),
            Message::user(render_transcript(messages)),
        ];
        let request = ProviderRequest {
            messages: &request_messages,
            tools: &[],
            tool_choice: ToolChoice::None,
            stream: false,
            tool_instructions: None,
        };

        let mut stream = send_with_retry(self.provider, request, self.retry).await?;
        let mut assembler = ResponseAssembler::new();
        while let Some(event) = stream.next().await {
            assembler.push(&event?);
        }
        let response = assembler.finish();
        if response.stop.is_interrupted() {
            return Err(ModelError::InvalidResponse(format!(
                "summary request ended with {}",
                response.stop
            )));
        }
        Ok(response.text)
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut} [...]")
    }
}

/// Plain-text transcript of `messages` for summarization.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let label = match (msg.role, msg.kind) {
            (_, MessageKind::Summary) => "earlier summary",
            (Role::System, _) => "system",
            (Role::User, _) => "user",
            (Role::Assistant, _) => "assistant",
            (Role::Tool, _) => "tool",
        };
        if let Some(result) = &msg.tool_result {
            let status = if result.is_error() { "error" } else { "ok" };
            out.push_str(&format!(
                "{label} [{} {status}]: {}\n",
                result.call_id,
                clip(&result.content, TRANSCRIPT_MESSAGE_CHARS)
            ));
            continue;
        }
        if !msg.content.is_empty() {
            out.push_str(&format!("{label}: {}\n", clip(&msg.content, TRANSCRIPT_MESSAGE_CHARS)));
        }
        for call in &msg.tool_calls {
            out.push_str(&format!(
                "{label} calls {} [{}]: {}\n",
                call.name,
                call.id,
                clip(&call.raw, TRANSCRIPT_MESSAGE_CHARS)
            ));
        }
    }
    out
}

/// Deterministic stand-in used when the summarizer fails.
pub fn digest(messages: &[Message]) -> String {
    let mut requests = Vec::new();
    let mut tools = BTreeSet::new();
    let mut earlier = None;
    for msg in messages {
        if msg.kind == MessageKind::Summary {
            earlier = Some(clip(&msg.content, 1_000));
        } else if msg.starts_turn() {
            requests.push(clip(msg.content.trim(), 200));
        }
        for call in &msg.tool_calls {
            tools.insert(call.name.as_str());
        }
    }

    let mut out = String::from("Earlier conversation (condensed without a model summary).\n");
    if let Some(earlier) = earlier {
        out.push_str(&format!("\nPreviously:\n{earlier}\n"));
    }
    if !requests.is_empty() {
        out.push_str("\nUser requests:\n");
        for request in &requests {
            out.push_str(&format!("- {request}\n"));
        }
    }
    if !tools.is_empty() {
        let tools: Vec<&str> = tools.into_iter().collect();
        out.push_str(&format!("\nTools used: {}\n", tools.join(", ")));
    }
    out
}

/// Tool reinstruction injected on every compaction.
pub fn reinstruction(tools: &[ToolSpec]) -> Message {
    let mut text = String::from("[Tool reminder]\n");
    if tools.is_empty() {
        text.push_str("No tools are available right now.\n");
    } else {
        text.push_str("These tools are available:\n");
        for tool in tools {
            text.push_str(&format!("- {}: {}\n", tool.name, tool.brief()));
        }
    }
    text.push_str(
        "\nTo get information or take an action, call a tool and wait for its result. \
         Never state or guess a tool result that you did not receive.",
    );
    Message::user(text).with_kind(MessageKind::Reinstruction)
}

/// Result of one compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Messages replaced by the summary.
    pub summarized: usize,
    /// The summarizer failed and the digest was used.
    pub used_fallback: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub repair: RepairReport,
}

/// Decides when and what to compact.
#[derive(Debug, Clone)]
pub struct Compactor {
    config: ContextConfig,
}

impl Compactor {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Whether the estimate exceeds the effective ceiling.
    pub fn needs_compaction(&self, history: &History) -> bool {
        history.estimate_tokens() > self.config.effective_ceiling()
    }

    /// The span to summarize, if any.
    ///
    /// Starts after a leading system message and ends at the start of the
    /// oldest user turn that is kept verbatim.
    pub fn select_span(&self, messages: &[Message]) -> Option<Range<usize>> {
        let start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
        let turn_starts: Vec<usize> = messages
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, m)| m.starts_turn())
            .map(|(i, _)| i)
            .collect();

        let keep = self.config.keep_recent_turns.max(1);
        if turn_starts.len() <= keep {
            return None;
        }
        let end = turn_starts[turn_starts.len() - keep];
        (end > start).then_some(start..end)
    }

    /// Compact `history` in place.
    ///
    /// Returns `None` when there is nothing old enough to summarize.
    pub async fn compact<S: Summarizer>(
        &self,
        history: &mut History,
        summarizer: &S,
        tools: &[ToolSpec],
        allow: &ToolAllowList,
    ) -> Option<CompactionOutcome> {
        let Some(span) = self.select_span(history.as_slice()) else {
            warn!(
                tokens = history.estimate_tokens(),
                "context over budget but no complete turn can be compacted"
            );
            return None;
        };
        let tokens_before = history.estimate_tokens();

        let condensed: Vec<Message> = history.as_slice()[span.clone()]
            .iter()
            .filter(|m| m.kind != MessageKind::Reinstruction)
            .cloned()
            .collect();

        let (summary, used_fallback) = match summarizer.summarize(&condensed).await {
            Ok(text) if !text.trim().is_empty() => (text, false),
            Ok(_) => {
                warn!("summarizer returned nothing, using digest");
                (digest(&condensed), true)
            }
            Err(err) => {
                warn!(error = %err, "summarization failed, using digest");
                (digest(&condensed), true)
            }
        };

        let summarized = span.len();
        history.splice(
            span,
            vec![
                Message::user(format!("{SUMMARY_HEADER}\n\n{}", summary.trim()))
                    .with_kind(MessageKind::Summary),
                reinstruction(tools),
            ],
        );
        let (repaired, report) = repair(history.as_slice().to_vec(), allow);
        history.replace_all(repaired);

        let tokens_after = history.estimate_tokens();
        info!(
            summarized,
            tokens_before, tokens_after, used_fallback, "context compacted"
        );
        Some(CompactionOutcome {
            summarized,
            used_fallback,
            tokens_before,
            tokens_after,
            repair: report,
        })
    }
}
