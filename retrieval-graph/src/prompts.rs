//! Prompt templates for the graph nodes.

use crate::state::SUMMARY_MARKER;

/// System directive prepended before every model call in the
/// query-or-respond node.
pub const RETRIEVE_FIRST_DIRECTIVE: &str = "在回答任何用户问题之前，你必须始终使用 retrieve_documents 工具来搜索信息。\
不要在没有检索的情况下直接回答。始终首先调用 retrieve_documents 工具来搜索知识库。";

pub fn grade_prompt(question: &str, context: &str) -> String {
    format!(
        "你是一个评估文档相关性的评分员。请评估检索到的文档是否与用户问题相关。\n\n\
         检索到的文档内容：\n{context}\n\n\
         用户问题：{question}\n\n\
         **判断标准：**\n\
         - 如果文档包含直接回答或与核心问题相关的信息，返回 'yes'，即使文档没有提到问题中的所有细节。\n\
         - 如果文档涉及主要主题或提供相关信息，返回 'yes'。\n\
         - 只有当文档与问题完全无关或不相关时，才返回 'no'。\n\n\
         请给出二元评分 'yes' 或 'no' 来表示相关性。"
    )
}

pub fn rewrite_prompt(question: &str) -> String {
    format!(
        "你是一个问题重写助手。你的任务是将用户的问题重写为更具体、更易搜索的形式。\n\n\
         原始问题：\n ------- \n{question}\n ------- \n\n\
         **重要提示**：只返回改进后的问题文本，不要包含其他内容。\
         不要包含任何分析、解释或评论。\
         不要包含类似'改进后的问题：'或'这是改进版本：'这样的短语。\
         只返回重写后的问题本身，作为一个清晰、可搜索的查询。\n\n\
         改进后的问题："
    )
}

pub fn generate_prompt(question: &str, context: &str) -> String {
    format!(
        "你是一个问答助手。请使用以下检索到的上下文内容来回答问题。\n\n\
         **指令：**\n\
         - 如果上下文包含足够的信息来回答问题，请提供清晰简洁的答案，不要有废话。\n\
         - 如果上下文只包含标题或目录而没有实际内容，你应该指出检索到的信息不足，并建议可能需要更具体的搜索。\n\n\
         问题：{question} \n\n\
         上下文：{context}\n\n\
         答案："
    )
}

pub fn no_content_prompt(question: &str) -> String {
    format!(
        "用户问题: {question}\n\n\
         经过多次尝试，我无法在提供的文档中找到与用户问题相关的内容。\
         请生成一个友好的回复，告知用户未找到相关内容，并建议用户重新表述问题或确认文档中是否包含相关信息。\
         回复应该简洁、友好，不超过3句话。"
    )
}

pub fn summary_prompt(history: &str, max_tokens: u32) -> String {
    format!(
        "请总结以下对话历史，保留关键信息和上下文，以便后续对话能够继续。\n\n\
         对话历史：\n{history}\n\n\
         请生成一个简洁的总结，包含：\n\
         1. 讨论的主要话题\n\
         2. 用户的关键问题和需求\n\
         3. 已提供的重要信息或答案\n\n\
         **重要限制**：总结内容不能超过 {max_tokens} tokens。请确保总结简洁、精炼，只保留最关键的信息。"
    )
}

/// Build a system message carrying the summary section, preserving the
/// non-summary part of an existing system message.
pub fn system_with_summary(existing: Option<&str>, summary: &str) -> String {
    match existing {
        Some(content) if content.contains(SUMMARY_MARKER) => {
            let base = content
                .split(SUMMARY_MARKER)
                .next()
                .unwrap_or_default()
                .trim_end();
            if base.is_empty() {
                format!("{SUMMARY_MARKER}\n{summary}")
            } else {
                format!("{base}\n\n{SUMMARY_MARKER}\n{summary}")
            }
        }
        Some(content) if !content.trim().is_empty() => {
            format!("{}\n\n{SUMMARY_MARKER}\n{summary}", content.trim_end())
        }
        _ => format!("{SUMMARY_MARKER}\n{summary}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_section_is_replaced_not_duplicated() {
        let first = system_with_summary(Some("base directive"), "first summary");
        assert_eq!(first.matches(SUMMARY_MARKER).count(), 1);
        assert!(first.starts_with("base directive"));

        let second = system_with_summary(Some(&first), "second summary");
        assert_eq!(second.matches(SUMMARY_MARKER).count(), 1);
        assert!(second.contains("second summary"));
        assert!(!second.contains("first summary"));
        assert!(second.starts_with("base directive"));
    }

    #[test]
    fn summary_without_existing_system() {
        let content = system_with_summary(None, "summary body");
        assert!(content.starts_with(SUMMARY_MARKER));
        assert!(content.contains("summary body"));
    }

    #[test]
    fn prompts_embed_their_inputs() {
        assert!(grade_prompt("Q", "CTX").contains("CTX"));
        assert!(rewrite_prompt("Q").contains("Q"));
        assert!(generate_prompt("Q", "CTX").contains("Q"));
        assert!(no_content_prompt("Q").contains("Q"));
    }
}
