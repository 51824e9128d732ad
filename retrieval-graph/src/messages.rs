//! Provider-neutral chat messages and the tool-call integrity pass.
//!
//! Several providers enforce the pairing invariant strictly: every
//! assistant tool call must be answered by exactly one tool message with
//! the same id before the next user or assistant turn. History that
//! violates it (crashed runs, summarization cuts, provider quirks) is
//! repaired here rather than surfaced.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as the provider sends them.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Repair a message list so every assistant tool call is matched exactly
/// once by a following tool message.
///
/// Rules, in order:
/// 1. Tool-call ids are normalized to non-empty strings (fresh UUIDs for
///    missing ones).
/// 2. Tool messages that answer no pending call are dropped, as are
///    duplicate answers to the same id.
/// 3. An assistant whose calls are partially unmatched keeps only the
///    matched calls when it has textual content or at least one match;
///    a contentless assistant with zero matches is dropped entirely.
/// 4. Tool messages with no preceding assistant call are dropped.
pub fn enforce_tool_call_integrity(messages: Vec<ChatTurn>) -> Vec<ChatTurn> {
    let mut output: Vec<ChatTurn> = Vec::with_capacity(messages.len());
    let mut index = 0;

    while index < messages.len() {
        let Some(message) = messages.get(index) else {
            break;
        };

        match message.role {
            ChatRole::Tool => {
                // Orphan tool message, nothing upstream claimed it
                index = index.saturating_add(1);
            }
            ChatRole::Assistant if !message.tool_calls.is_empty() => {
                let mut assistant = message.clone();
                for call in &mut assistant.tool_calls {
                    if call.id.trim().is_empty() {
                        call.id = Uuid::new_v4().to_string();
                    }
                }

                let mut pending = assistant.tool_calls.clone();
                let mut matched_calls: Vec<ToolCall> = Vec::new();
                let mut kept_tools: Vec<ChatTurn> = Vec::new();

                let mut cursor = index.saturating_add(1);
                while let Some(candidate) = messages.get(cursor) {
                    if candidate.role != ChatRole::Tool {
                        break;
                    }
                    if let Some(position) = pending.iter().position(|call| {
                        candidate.tool_call_id.as_deref() == Some(call.id.as_str())
                    }) {
                        matched_calls.push(pending.remove(position));
                        kept_tools.push(candidate.clone());
                    }
                    cursor = cursor.saturating_add(1);
                }

                if pending.is_empty() {
                    output.push(assistant);
                    output.extend(kept_tools);
                } else if !assistant.content.trim().is_empty() || !matched_calls.is_empty() {
                    assistant.tool_calls = matched_calls;
                    output.push(assistant);
                    output.extend(kept_tools);
                }
                // else: contentless assistant with zero matched calls is dropped

                index = cursor;
            }
            _ => {
                output.push(message.clone());
                index = index.saturating_add(1);
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "retrieve_documents".to_string(),
            arguments: r#"{"query":"q"}"#.to_string(),
        }
    }

    #[test]
    fn well_formed_history_is_untouched() {
        let messages = vec![
            ChatTurn::system("sys"),
            ChatTurn::user("question"),
            ChatTurn::assistant_with_tool_calls("", vec![call("abc")]),
            ChatTurn::tool("result", "abc"),
            ChatTurn::assistant("answer"),
        ];

        let repaired = enforce_tool_call_integrity(messages.clone());
        assert_eq!(repaired, messages);
    }

    #[test]
    fn mismatched_tool_message_is_dropped_and_assistant_emptied() {
        // The S6 seed: assistant calls "abc", tool answers "xyz"
        let messages = vec![
            ChatTurn::user("question"),
            ChatTurn::assistant_with_tool_calls("thinking out loud", vec![call("abc")]),
            ChatTurn::tool("result", "xyz"),
        ];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[1].role, ChatRole::Assistant);
        assert!(repaired[1].tool_calls.is_empty());
        assert_eq!(repaired[1].content, "thinking out loud");
    }

    #[test]
    fn contentless_assistant_with_no_matches_is_dropped() {
        let messages = vec![
            ChatTurn::user("question"),
            ChatTurn::assistant_with_tool_calls("", vec![call("abc")]),
            ChatTurn::tool("result", "xyz"),
        ];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].role, ChatRole::User);
    }

    #[test]
    fn duplicate_tool_answers_keep_only_the_first() {
        let messages = vec![
            ChatTurn::assistant_with_tool_calls("", vec![call("abc")]),
            ChatTurn::tool("first", "abc"),
            ChatTurn::tool("second", "abc"),
        ];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[1].content, "first");
    }

    #[test]
    fn orphan_tool_message_is_dropped() {
        let messages = vec![ChatTurn::tool("stray", "abc"), ChatTurn::user("question")];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].role, ChatRole::User);
    }

    #[test]
    fn empty_ids_are_normalized_to_uuids() {
        let messages = vec![ChatTurn::assistant_with_tool_calls(
            "text",
            vec![ToolCall {
                id: String::new(),
                name: "retrieve_documents".to_string(),
                arguments: "{}".to_string(),
            }],
        )];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 1);
        // Unmatched (no tool message follows) but assistant has content,
        // so the call list is emptied rather than the assistant dropped
        assert!(repaired[0].tool_calls.is_empty());
    }

    #[test]
    fn partial_match_keeps_matched_calls() {
        let messages = vec![
            ChatTurn::assistant_with_tool_calls("", vec![call("a"), call("b")]),
            ChatTurn::tool("answer a", "a"),
            ChatTurn::user("next"),
        ];

        let repaired = enforce_tool_call_integrity(messages);
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[0].tool_calls.len(), 1);
        assert_eq!(repaired[0].tool_calls[0].id, "a");
        assert_eq!(repaired[1].role, ChatRole::Tool);
        assert_eq!(repaired[2].role, ChatRole::User);
    }
}
