//! Conversation summarization.
//!
//! Long histories are compressed into a summary section on the system
//! message. The token estimator is a CJK-weighted character count; a
//! provider tokenizer could be substituted without changing any contract.

use common::error::AppError;
use tracing::{debug, info};

use crate::{
    llm::{ChatModel, ChatRequest},
    messages::{enforce_tool_call_integrity, ChatRole, ChatTurn},
    prompts::{summary_prompt, system_with_summary},
    state::{classify_update, MessagesUpdate},
};

/// Temperature for the summarizer call; summaries should be stable.
const SUMMARY_TEMPERATURE: f32 = 0.2;

/// Per-turn cap when rendering history into the summary prompt.
const HISTORY_TURN_CHAR_LIMIT: usize = 500;

/// CJK characters weigh ~1.8 tokens, everything else non-whitespace ~0.4.
pub fn estimate_tokens(text: &str) -> f64 {
    let mut cjk = 0_u64;
    let mut other = 0_u64;

    for c in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) || ('\u{3400}'..='\u{4dbf}').contains(&c) {
            cjk = cjk.saturating_add(1);
        } else if !c.is_whitespace() {
            other = other.saturating_add(1);
        }
    }

    cjk as f64 * 1.8 + other as f64 * 0.4
}

pub fn estimate_messages_tokens(messages: &[ChatTurn]) -> usize {
    let total: f64 = messages
        .iter()
        .map(|turn| estimate_tokens(&turn.content))
        .sum();
    total.round() as usize
}

/// Compress history when it crosses the token threshold.
///
/// Returns `None` when nothing needs to happen; otherwise a `Replace`
/// update containing `[system-with-summary] + last keep messages`.
pub async fn summarize_messages(
    messages: &[ChatTurn],
    model: &dyn ChatModel,
    threshold: usize,
    keep: usize,
    max_tokens: u32,
) -> Result<Option<MessagesUpdate>, AppError> {
    let total_tokens = estimate_messages_tokens(messages);
    if total_tokens < threshold {
        return Ok(None);
    }

    let system_content = messages
        .iter()
        .find(|turn| turn.role == ChatRole::System)
        .map(|turn| turn.content.clone());

    let non_system: Vec<ChatTurn> = messages
        .iter()
        .filter(|turn| turn.role != ChatRole::System)
        .cloned()
        .collect();

    if non_system.len() <= keep {
        return Ok(None);
    }

    let boundary = non_system.len().saturating_sub(keep);
    let mut old: Vec<ChatTurn> = non_system.get(..boundary).unwrap_or_default().to_vec();
    let mut new: Vec<ChatTurn> = non_system.get(boundary..).unwrap_or_default().to_vec();

    repair_boundary(&mut old, &mut new);

    // Orphaned tool plumbing inside the summarized span must not survive
    old = enforce_tool_call_integrity(old);
    if old.is_empty() {
        return Ok(None);
    }

    debug!(
        total_tokens,
        old_count = old.len(),
        new_count = new.len(),
        "summarizing conversation history"
    );

    let history = format_for_summary(&old);
    let outcome = model
        .invoke(ChatRequest {
            messages: vec![ChatTurn::user(summary_prompt(&history, max_tokens))],
            bind_retrieve_tool: false,
            temperature: Some(SUMMARY_TEMPERATURE),
            max_tokens: Some(max_tokens),
            json_schema: None,
        })
        .await?;

    let summary = clean_summary(&outcome.content);
    if summary.is_empty() {
        return Ok(None);
    }

    info!(
        summarized = old.len(),
        kept = new.len(),
        "conversation history summarized"
    );

    let mut replacement = vec![ChatTurn::system(system_with_summary(
        system_content.as_deref(),
        &summary,
    ))];
    replacement.extend(new);

    Ok(Some(classify_update(replacement)))
}

/// The cut may land between an assistant's tool call and its result: move
/// the matching assistant forward, or drop the dangling tool message.
fn repair_boundary(old: &mut Vec<ChatTurn>, new: &mut Vec<ChatTurn>) {
    while let Some(first) = new.first() {
        if first.role != ChatRole::Tool {
            break;
        }
        let call_id = first.tool_call_id.clone();

        let owner = call_id.as_ref().and_then(|id| {
            old.iter().position(|turn| {
                turn.role == ChatRole::Assistant
                    && turn.tool_calls.iter().any(|call| &call.id == id)
            })
        });

        match owner {
            Some(position) => {
                let assistant = old.remove(position);
                new.insert(0, assistant);
            }
            None => {
                new.remove(0);
            }
        }
    }
}

fn format_for_summary(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                ChatRole::System => "System",
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
                ChatRole::Tool => "Tool",
            };
            let content: String = turn.content.chars().take(HISTORY_TURN_CHAR_LIMIT).collect();
            format!("{speaker}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_summary(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fence = trimmed
        .strip_prefix("```")
        .map(|rest| rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    without_fence.trim().to_string()
}
