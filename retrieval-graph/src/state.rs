//! Per-invocation graph state and the messages reducer.

use crate::messages::{ChatRole, ChatTurn};

/// Marker naming the summary section inside the system message. Exactly one
/// such section may exist at any time.
pub const SUMMARY_MARKER: &str = "[对话历史总结]";

/// State threaded through one graph invocation.
///
/// `retry_count` is request-scoped: rehydrating a checkpoint restores the
/// message history but never the counter.
#[derive(Debug, Clone)]
pub struct RetrievalState {
    pub messages: Vec<ChatTurn>,
    pub current_query: String,
    pub retry_count: u32,
    pub no_relevant_found: bool,
}

/// Message updates are append-only except for summarization, which replaces
/// the whole list.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagesUpdate {
    Append(Vec<ChatTurn>),
    Replace(Vec<ChatTurn>),
}

impl RetrievalState {
    pub fn new(question: &str) -> Self {
        Self {
            messages: vec![ChatTurn::user(question)],
            current_query: question.to_string(),
            retry_count: 0,
            no_relevant_found: false,
        }
    }

    /// Start a request on top of checkpointed history. The new user turn is
    /// appended; `retry_count` starts at zero regardless of what any prior
    /// run left behind.
    pub fn from_history(history: Vec<ChatTurn>, question: &str) -> Self {
        let mut messages = history;
        messages.push(ChatTurn::user(question));
        Self {
            messages,
            current_query: question.to_string(),
            retry_count: 0,
            no_relevant_found: false,
        }
    }

    pub fn apply(&mut self, update: MessagesUpdate) {
        match update {
            MessagesUpdate::Append(batch) => self.messages.extend(batch),
            MessagesUpdate::Replace(batch) => self.messages = batch,
        }
    }
}

/// Classify an incoming batch the way the reducer contract describes: a
/// batch beginning with a system message that carries the summary marker
/// replaces the history, anything else appends.
pub fn classify_update(batch: Vec<ChatTurn>) -> MessagesUpdate {
    let replaces = batch
        .first()
        .is_some_and(|turn| turn.role == ChatRole::System && turn.content.contains(SUMMARY_MARKER));
    if replaces {
        MessagesUpdate::Replace(batch)
    } else {
        MessagesUpdate::Append(batch)
    }
}
