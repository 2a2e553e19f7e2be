//! Conversation history with a running size estimate.

use crate::model::Message;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use storage::SessionId;
use tracing::debug;

const CHARS_PER_TOKEN: usize = 4;

/// The message sequence of one session.
///
/// Messages are only appended, or replaced wholesale by compaction and
/// repair. There is no mutable access to individual messages, so the
/// size estimate always matches the contents.
#[derive(Debug, Clone, Default)]
pub struct History {
    messages: Vec<Message>,
    chars: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        let chars = messages.iter().map(Message::char_len).sum();
        Self { messages, chars }
    }

    pub fn push(&mut self, message: Message) {
        self.chars += message.char_len();
        self.messages.push(message);
    }

    /// Replace `range` with `replacement`.
    pub fn splice(&mut self, range: Range<usize>, replacement: Vec<Message>) {
        let removed: usize = self.messages[range.clone()].iter().map(Message::char_len).sum();
        let added: usize = replacement.iter().map(Message::char_len).sum();
        self.messages.splice(range, replacement);
        self.chars = self.chars - removed + added;
    }

    /// Replace every message.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        *self = Self::from_messages(messages);
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }

    /// Estimated token count (characters / 4).
    pub fn estimate_tokens(&self) -> usize {
        self.chars / CHARS_PER_TOKEN
    }
}

/// Histories of recently used sessions, least recently used evicted first.
///
/// Empty histories are never stored. A miss means the caller reloads the
/// session from its store.
#[derive(Debug)]
pub(crate) struct HistoryCache {
    capacity: usize,
    entries: HashMap<SessionId, History>,
    recency: VecDeque<SessionId>,
}

impl HistoryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Remove and return a cached history.
    pub(crate) fn take(&mut self, session_id: &SessionId) -> Option<History> {
        let history = self.entries.remove(session_id)?;
        self.recency.retain(|id| id != session_id);
        Some(history)
    }

    pub(crate) fn put(&mut self, session_id: SessionId, history: History) {
        self.take(&session_id);
        if self.capacity == 0 || history.is_empty() {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(session = %oldest, "evicted cached history");
        }
        self.entries.insert(session_id, history);
        self.recency.push_back(session_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
