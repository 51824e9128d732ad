//! The retrieval graph runtime.
//!
//! An explicit node loop over `RetrievalState`:
//!
//! ```text
//! start → [summarize?] → query_or_respond → retrieve → grade
//! grade --yes or budget exhausted--> answer → end
//! grade --no and budget left------> rewrite → [summarize?] → query_or_respond
//! ```
//!
//! The model is always asked to call `retrieve_documents` first; when a
//! provider answers without a tool call one is synthesized so the graph
//! never skips retrieval.

use std::sync::Arc;

use common::{error::AppError, storage::types::checkpoint::Checkpoint};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    checkpoint::CheckpointStore,
    events::{GraphEvent, ThinkingStep},
    llm::{grade_schema, ChatModel, ChatOutcome, ChatRequest, TokenUsage, RETRIEVE_TOOL_NAME},
    messages::{enforce_tool_call_integrity, ChatRole, ChatTurn, ToolCall},
    prompts::{
        generate_prompt, grade_prompt, no_content_prompt, rewrite_prompt,
        RETRIEVE_FIRST_DIRECTIVE,
    },
    retriever::{RetrievedDoc, Retriever},
    state::{MessagesUpdate, RetrievalState},
    summarize::{estimate_messages_tokens, estimate_tokens, summarize_messages},
};

/// Hard cap applied to rewritten queries.
const REWRITE_CHAR_LIMIT: usize = 200;

/// Prefixes models like to prepend despite instructions.
const REWRITE_PREFIXES: [&str; 6] = [
    "改进后的问题：",
    "改进后的问题:",
    "Improved question:",
    "**Improved question:**",
    "Refined question:",
    "Rewritten question:",
];

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub max_retry_count: u32,
    pub use_summarization: bool,
    pub summarization_threshold: usize,
    pub summarization_keep: usize,
    pub summarization_max_tokens: u32,
}

impl GraphConfig {
    pub fn from_app_config(config: &common::utils::config::AppConfig) -> Self {
        Self {
            max_retry_count: config.max_retry_count,
            use_summarization: config.use_message_summarization,
            summarization_threshold: config.message_summarization_threshold,
            summarization_keep: config.message_summarization_keep_messages,
            summarization_max_tokens: config.message_summarization_max_tokens,
        }
    }

    /// Rewrites allowed per run; with the default budget of 3 this is 2,
    /// i.e. `retry_count < 2 → rewrite, ≥ 2 → answer`.
    fn rewrite_budget(&self) -> u32 {
        self.max_retry_count.saturating_sub(1)
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            use_summarization: true,
            summarization_threshold: 8_000,
            summarization_keep: 20,
            summarization_max_tokens: 500,
        }
    }
}

/// Result of one graph invocation.
#[derive(Debug)]
pub struct GraphRun {
    pub answer: String,
    pub retrieved_docs: Vec<RetrievedDoc>,
    pub thinking: Vec<ThinkingStep>,
    pub tokens_used: u64,
    pub no_relevant_found: bool,
}

enum Node {
    Summarize,
    QueryOrRespond,
    Retrieve,
    Grade,
    Rewrite,
    Answer { no_relevant: bool },
}

#[derive(Default)]
struct TokenTally {
    total: u64,
}

impl TokenTally {
    fn add_usage(&mut self, usage: Option<TokenUsage>, fallback_input: &str, fallback_output: &str) {
        match usage {
            Some(usage) => {
                self.total = self
                    .total
                    .saturating_add(usage.input_tokens)
                    .saturating_add(usage.output_tokens);
            }
            None => {
                let estimate = estimate_tokens(fallback_input) + estimate_tokens(fallback_output);
                self.total = self.total.saturating_add(estimate.round() as u64);
            }
        }
    }
}

pub struct RetrievalGraph {
    model: Arc<dyn ChatModel>,
    retriever: Arc<Retriever>,
    checkpoint: Option<Arc<CheckpointStore>>,
    config: GraphConfig,
}

impl RetrievalGraph {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<Retriever>,
        checkpoint: Option<Arc<CheckpointStore>>,
        config: GraphConfig,
    ) -> Self {
        Self {
            model,
            retriever,
            checkpoint,
            config,
        }
    }

    pub fn reranker_ready(&self) -> bool {
        self.retriever.reranker_ready()
    }

    /// Run the graph for one user turn, emitting events as it goes.
    ///
    /// Event delivery is best-effort: a dropped receiver (client gone)
    /// never aborts the run, so the assistant turn still gets persisted.
    #[tracing::instrument(skip_all, fields(%user_id, %session_id))]
    pub async fn run(
        &self,
        user_id: &str,
        session_id: &str,
        question: &str,
        events: &mpsc::Sender<GraphEvent>,
    ) -> Result<GraphRun, AppError> {
        let thread_id = Checkpoint::thread_id(user_id, session_id);

        let history = match &self.checkpoint {
            Some(store) => store.load(&thread_id).await?.unwrap_or_default(),
            None => Vec::new(),
        };

        // retry_count is request-scoped by construction: from_history never
        // carries a counter over from a previous run.
        let mut state = RetrievalState::from_history(history, question);

        let mut thinking: Vec<ThinkingStep> = Vec::new();
        let mut tokens = TokenTally::default();
        let mut retrieved_docs: Vec<RetrievedDoc> = Vec::new();
        let mut last_tool_output = String::new();
        let mut last_call_id: Option<String> = None;
        let mut answer = String::new();
        let mut answered_no_relevant = false;

        let mut node = Node::Summarize;

        loop {
            match node {
                Node::Summarize => {
                    if self.config.use_summarization {
                        let update = summarize_messages(
                            &state.messages,
                            self.model.as_ref(),
                            self.config.summarization_threshold,
                            self.config.summarization_keep,
                            self.config.summarization_max_tokens,
                        )
                        .await?;
                        if let Some(update) = update {
                            state.apply(update);
                            self.emit_thinking(
                                events,
                                session_id,
                                &mut thinking,
                                "summarize_messages",
                                "Compressed long conversation history into a summary",
                                json!({
                                    "kept_messages": self.config.summarization_keep,
                                    "estimated_tokens": estimate_messages_tokens(&state.messages),
                                }),
                            )
                            .await;
                        }
                    }
                    node = Node::QueryOrRespond;
                }
                Node::QueryOrRespond => {
                    state.messages = enforce_tool_call_integrity(std::mem::take(&mut state.messages));
                    ensure_retrieve_directive(&mut state.messages);

                    let request = ChatRequest {
                        messages: state.messages.clone(),
                        bind_retrieve_tool: true,
                        temperature: None,
                        max_tokens: None,
                        json_schema: None,
                    };
                    let prompt_text = request_text(&request);
                    let outcome = self.model.invoke(request).await?;
                    tokens.add_usage(outcome.usage, &prompt_text, &outcome.content);

                    let mut calls = outcome.tool_calls;
                    if calls.is_empty() {
                        // Provider ignored the tool mandate; retrieval is
                        // not optional, so synthesize the call.
                        warn!(%user_id, "model returned no tool call, forcing retrieval");
                        calls = vec![ToolCall {
                            id: Uuid::new_v4().to_string(),
                            name: RETRIEVE_TOOL_NAME.to_string(),
                            arguments: json!({ "query": state.current_query }).to_string(),
                        }];
                        self.emit_thinking(
                            events,
                            session_id,
                            &mut thinking,
                            "forced_tool_call",
                            "Model skipped retrieval, forced a retrieve_documents call",
                            json!({ "query": state.current_query }),
                        )
                        .await;
                    } else {
                        // A rewrite must take effect on the next retrieval
                        for call in &mut calls {
                            if call.name == RETRIEVE_TOOL_NAME {
                                call.arguments =
                                    json!({ "query": state.current_query }).to_string();
                            }
                        }
                    }

                    last_call_id = calls.first().map(|call| call.id.clone());
                    state.apply(MessagesUpdate::Append(vec![
                        ChatTurn::assistant_with_tool_calls(outcome.content, calls),
                    ]));

                    self.emit_thinking(
                        events,
                        session_id,
                        &mut thinking,
                        "query_or_respond",
                        "Requested retrieval from the knowledge base",
                        json!({ "query": state.current_query }),
                    )
                    .await;

                    node = Node::Retrieve;
                }
                Node::Retrieve => {
                    let (output, docs) = self
                        .retriever
                        .retrieve(user_id, &state.current_query)
                        .await?;
                    retrieved_docs = docs;
                    last_tool_output.clone_from(&output);

                    let call_id = last_call_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    state.apply(MessagesUpdate::Append(vec![ChatTurn::tool(
                        output, call_id,
                    )]));

                    self.emit_thinking(
                        events,
                        session_id,
                        &mut thinking,
                        "retrieve_documents",
                        "Ran hybrid retrieval over the document index",
                        json!({
                            "query": state.current_query,
                            "documents": retrieved_docs.len(),
                        }),
                    )
                    .await;

                    node = Node::Grade;
                }
                Node::Grade => {
                    let relevant = self
                        .grade(&state.current_query, &last_tool_output, &mut tokens)
                        .await;

                    self.emit_thinking(
                        events,
                        session_id,
                        &mut thinking,
                        "grade_documents",
                        "Judged relevance of the retrieved context",
                        json!({
                            "relevant": relevant,
                            "retry_count": state.retry_count,
                        }),
                    )
                    .await;

                    node = if relevant {
                        Node::Answer { no_relevant: false }
                    } else if state.retry_count < self.config.rewrite_budget() {
                        Node::Rewrite
                    } else {
                        state.no_relevant_found = true;
                        Node::Answer { no_relevant: true }
                    };
                }
                Node::Rewrite => {
                    let request = ChatRequest::plain(vec![ChatTurn::user(rewrite_prompt(
                        &state.current_query,
                    ))]);
                    let prompt_text = request_text(&request);
                    let outcome = self.model.invoke(request).await?;
                    tokens.add_usage(outcome.usage, &prompt_text, &outcome.content);

                    let rewritten = clean_rewrite(&outcome.content, &state.current_query);
                    debug!(%user_id, rewritten = %rewritten, "query rewritten");

                    state.current_query.clone_from(&rewritten);
                    state.retry_count = state.retry_count.saturating_add(1);
                    state.apply(MessagesUpdate::Append(vec![ChatTurn::user(rewritten.clone())]));

                    self.emit_thinking(
                        events,
                        session_id,
                        &mut thinking,
                        "rewrite_question",
                        "Reformulated the question for another retrieval attempt",
                        json!({
                            "rewritten_query": rewritten,
                            "retry_count": state.retry_count,
                        }),
                    )
                    .await;

                    node = Node::Summarize;
                }
                Node::Answer { no_relevant } => {
                    answered_no_relevant = no_relevant;

                    self.emit_thinking(
                        events,
                        session_id,
                        &mut thinking,
                        "generate_answer",
                        if no_relevant {
                            "No relevant content found, generating a polite notice"
                        } else {
                            "Generating the grounded answer"
                        },
                        json!({ "no_relevant": no_relevant }),
                    )
                    .await;

                    let prompt = if no_relevant {
                        no_content_prompt(&state.current_query)
                    } else {
                        generate_prompt(&state.current_query, &last_tool_output)
                    };

                    let mut stream = self
                        .model
                        .stream(ChatRequest::plain(vec![ChatTurn::user(prompt.clone())]))
                        .await?;

                    while let Some(delta) = stream.next().await {
                        let delta = delta?;
                        if delta.is_empty() {
                            continue;
                        }
                        answer.push_str(&delta);
                        let _ = events
                            .send(GraphEvent::Chunk {
                                content: delta,
                                session_id: session_id.to_string(),
                            })
                            .await;
                    }

                    tokens.add_usage(None, &prompt, &answer);

                    state.retry_count = 0;
                    state.apply(MessagesUpdate::Append(vec![ChatTurn::assistant(
                        answer.clone(),
                    )]));

                    if let Some(store) = &self.checkpoint {
                        let repaired =
                            enforce_tool_call_integrity(std::mem::take(&mut state.messages));
                        store.save(&thread_id, user_id, &repaired).await?;
                        state.messages = repaired;
                    }

                    break;
                }
            }
        }

        info!(
            %user_id,
            %session_id,
            answer_chars = answer.chars().count(),
            documents = retrieved_docs.len(),
            tokens = tokens.total,
            no_relevant = answered_no_relevant,
            "graph run completed"
        );

        let run = GraphRun {
            answer,
            retrieved_docs,
            thinking,
            tokens_used: tokens.total,
            no_relevant_found: answered_no_relevant,
        };

        let _ = events
            .send(GraphEvent::Complete {
                answer: run.answer.clone(),
                retrieved_docs: run.retrieved_docs.clone(),
                thinking_process: run.thinking.clone(),
                tokens_used: run.tokens_used,
                session_id: session_id.to_string(),
            })
            .await;

        Ok(run)
    }

    /// Structured-output relevance judgment; any failure degrades to `no`
    /// so the safe path (rewrite) is taken.
    async fn grade(&self, question: &str, context: &str, tokens: &mut TokenTally) -> bool {
        let request = ChatRequest {
            messages: vec![ChatTurn::user(grade_prompt(question, context))],
            bind_retrieve_tool: false,
            temperature: Some(0.0),
            max_tokens: None,
            json_schema: Some(grade_schema()),
        };
        let prompt_text = request_text(&request);

        match self.model.invoke(request).await {
            Ok(ChatOutcome { content, usage, .. }) => {
                tokens.add_usage(usage, &prompt_text, &content);
                match serde_json::from_str::<serde_json::Value>(&content) {
                    Ok(value) => value
                        .get("binary_score")
                        .and_then(serde_json::Value::as_str)
                        .map(|score| score.eq_ignore_ascii_case("yes"))
                        .unwrap_or(false),
                    Err(err) => {
                        warn!(error = %err, "grader output unparseable, treating as not relevant");
                        false
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "grader call failed, treating as not relevant");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_thinking(
        &self,
        events: &mpsc::Sender<GraphEvent>,
        session_id: &str,
        thinking: &mut Vec<ThinkingStep>,
        action: &str,
        description: &str,
        details: serde_json::Value,
    ) {
        let step = ThinkingStep {
            step: u32::try_from(thinking.len()).unwrap_or(u32::MAX).saturating_add(1),
            action: action.to_string(),
            description: description.to_string(),
            details,
        };
        thinking.push(step.clone());
        let _ = events
            .send(GraphEvent::Thinking {
                data: vec![step],
                session_id: session_id.to_string(),
            })
            .await;
    }
}

/// Make sure the leading system message mandates retrieval-first, creating
/// it when the history has none. The summary section, when present, is
/// left untouched behind the directive.
fn ensure_retrieve_directive(messages: &mut Vec<ChatTurn>) {
    match messages.first_mut() {
        Some(first) if first.role == ChatRole::System => {
            if !first.content.contains(RETRIEVE_FIRST_DIRECTIVE) {
                first.content = format!("{RETRIEVE_FIRST_DIRECTIVE}\n\n{}", first.content);
            }
        }
        _ => {
            messages.insert(0, ChatTurn::system(RETRIEVE_FIRST_DIRECTIVE));
        }
    }
}

/// Strip boilerplate prefixes, keep the first line, cap the length with a
/// first-sentence fallback. An empty result falls back to the original.
fn clean_rewrite(raw: &str, fallback: &str) -> String {
    let mut text = raw.trim().to_string();

    for prefix in REWRITE_PREFIXES {
        if let Some(stripped) = text.strip_prefix(prefix) {
            text = stripped.trim().to_string();
        }
    }

    text = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string();

    if text.chars().count() > REWRITE_CHAR_LIMIT {
        let sentence_end = text
            .char_indices()
            .find(|(_, c)| matches!(c, '。' | '.' | '!' | '！' | '?' | '？'))
            .map(|(index, c)| index + c.len_utf8());
        text = match sentence_end {
            Some(end) if text.get(..end).map_or(0, |s| s.chars().count()) <= REWRITE_CHAR_LIMIT => {
                text.get(..end).unwrap_or_default().to_string()
            }
            _ => text.chars().take(REWRITE_CHAR_LIMIT).collect(),
        };
    }

    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

fn request_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .map(|turn| turn.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatOutcome;
    use crate::retriever::RetrieverConfig;
    use crate::state::SUMMARY_MARKER;
    use crate::testing::ScriptedChatModel;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::{
        child_chunk::ChildChunk,
        parent_block::{ParentBlock, ParentMetadata},
    };
    use common::utils::embedding::EmbeddingProvider;

    const DIMENSION: usize = 32;

    async fn seeded_retriever(user_id: &str, passages: &[&str]) -> Arc<Retriever> {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("runtime_test", &database)
                .await
                .expect("memory db"),
        );
        db.ensure_initialized(DIMENSION).await.expect("schema");
        let provider =
            Arc::new(EmbeddingProvider::new_hashed(DIMENSION).expect("hashed provider"));

        let mut parents = Vec::new();
        let mut chunks = Vec::new();
        for (index, passage) in passages.iter().enumerate() {
            let parent_id = format!("parent-{index}");
            parents.push(ParentBlock::new(
                parent_id.clone(),
                "d1".to_string(),
                user_id.to_string(),
                (*passage).to_string(),
                ParentMetadata {
                    source: "notes.txt".to_string(),
                    title: None,
                },
            ));
            let embedding = provider.embed(passage).await.expect("embed passage");
            chunks.push(ChildChunk::new(
                "d1".to_string(),
                parent_id,
                user_id.to_string(),
                u32::try_from(index).expect("chunk id"),
                (*passage).to_string(),
                "notes.txt".to_string(),
                embedding,
            ));
        }
        if !parents.is_empty() {
            ParentBlock::replace_for_document(user_id, "d1", parents, &db)
                .await
                .expect("seed parents");
            ChildChunk::upsert_batch(chunks, &db)
                .await
                .expect("seed chunks");
            db.rebuild_indexes().await.expect("rebuild");
        }

        Arc::new(Retriever::new(
            db,
            provider,
            None,
            RetrieverConfig {
                retrieval_k: 10,
                use_hybrid: true,
                use_parent_child: true,
                rerank_top_k: 10,
                rerank_top_n: 3,
                rerank_score_threshold: None,
                store_is_local: true,
            },
        ))
    }

    fn tool_call_outcome(id: &str) -> ChatOutcome {
        ChatOutcome {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: RETRIEVE_TOOL_NAME.to_string(),
                arguments: json!({"query": "model chosen query"}).to_string(),
            }],
            usage: None,
        }
    }

    fn grade_outcome(score: &str) -> ChatOutcome {
        ChatOutcome {
            content: json!({ "binary_score": score }).to_string(),
            ..ChatOutcome::default()
        }
    }

    fn quiet_config() -> GraphConfig {
        GraphConfig {
            use_summarization: false,
            ..GraphConfig::default()
        }
    }

    async fn run_and_collect(
        graph: &RetrievalGraph,
        user_id: &str,
        session_id: &str,
        question: &str,
    ) -> (GraphRun, Vec<GraphEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let run = graph
            .run(user_id, session_id, question, &tx)
            .await
            .expect("graph run");
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (run, events)
    }

    #[tokio::test]
    async fn happy_path_streams_answer_grounded_in_retrieval() {
        let retriever =
            seeded_retriever("u1", &["The capital of France is Paris."]).await;
        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["The capital of France ", "is Paris."]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            None,
            quiet_config(),
        );

        let (run, events) =
            run_and_collect(&graph, "u1", "s1", "What is the capital of France?").await;

        assert!(run.answer.contains("Paris"));
        assert!(!run.retrieved_docs.is_empty());
        assert!(run.tokens_used > 0);
        assert!(!run.no_relevant_found);

        // thinking precedes chunks, complete is strictly last
        let first_chunk = events
            .iter()
            .position(|e| matches!(e, GraphEvent::Chunk { .. }))
            .expect("chunk events present");
        let first_thinking = events
            .iter()
            .position(|e| matches!(e, GraphEvent::Thinking { .. }))
            .expect("thinking events present");
        assert!(first_thinking < first_chunk);
        assert!(matches!(events.last(), Some(GraphEvent::Complete { .. })));

        // the answer prompt carried the retrieved context
        let stream_log = model.stream_log.lock().expect("stream log");
        assert!(stream_log[0].messages[0].content.contains("[Document 1]"));
    }

    #[tokio::test]
    async fn model_tool_call_query_is_overwritten_with_current_query() {
        let retriever = seeded_retriever("u1", &["Facts about llamas."]).await;
        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["answer"]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            Some(Arc::new(CheckpointStore::memory())),
            quiet_config(),
        );

        let (tx, _rx) = mpsc::channel(256);
        graph
            .run("u1", "s1", "tell me about llamas", &tx)
            .await
            .expect("graph run");

        let store = graph.checkpoint.as_ref().expect("checkpoint configured");
        let saved = store
            .load(&Checkpoint::thread_id("u1", "s1"))
            .await
            .expect("load checkpoint")
            .expect("checkpoint exists");

        let assistant = saved
            .iter()
            .find(|turn| !turn.tool_calls.is_empty())
            .expect("assistant with tool call saved");
        assert!(
            assistant.tool_calls[0]
                .arguments
                .contains("tell me about llamas"),
            "the model's own query must be overwritten: {}",
            assistant.tool_calls[0].arguments
        );
    }

    #[tokio::test]
    async fn missing_tool_call_is_forced() {
        let retriever = seeded_retriever("u1", &["Facts about llamas."]).await;
        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(ChatOutcome {
            content: "I can answer directly!".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["answer"]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            None,
            quiet_config(),
        );

        let (run, _events) = run_and_collect(&graph, "u1", "s1", "llamas?").await;
        assert!(run
            .thinking
            .iter()
            .any(|step| step.action == "forced_tool_call"));
    }

    #[tokio::test]
    async fn rewrite_loop_runs_once_when_second_grade_passes() {
        let retriever = seeded_retriever(
            "u1",
            &["Pelé was a Brazilian footballer widely seen as the greatest."],
        )
        .await;
        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("no"));
        model.push_invoke(ChatOutcome {
            content: "Improved question: Brazilian footballer Pelé".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(tool_call_outcome("call-2"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["Pelé was a Brazilian footballer."]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            None,
            quiet_config(),
        );

        let (run, _events) =
            run_and_collect(&graph, "u1", "s1", "best soccer player from Brazil").await;

        assert!(run.answer.contains("Pelé"));
        let rewrites: Vec<_> = run
            .thinking
            .iter()
            .filter(|step| step.action == "rewrite_question")
            .collect();
        assert_eq!(rewrites.len(), 1, "exactly one rewrite step");
        assert_eq!(rewrites[0].details["retry_count"], 1);

        // The second query_or_respond saw the rewritten question
        let log = model.invoke_log.lock().expect("invoke log");
        let second_qor = &log[3];
        assert!(second_qor
            .messages
            .iter()
            .any(|turn| turn.content.contains("Brazilian footballer Pelé")));
    }

    #[tokio::test]
    async fn exhausted_retries_produce_no_relevant_answer() {
        let retriever = seeded_retriever("u1", &[]).await;
        let model = Arc::new(ScriptedChatModel::new());
        // Three retrieval rounds: q_or_r + grade, with two rewrites between
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("no"));
        model.push_invoke(ChatOutcome {
            content: "rewrite one".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(tool_call_outcome("call-2"));
        model.push_invoke(grade_outcome("no"));
        model.push_invoke(ChatOutcome {
            content: "rewrite two".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(tool_call_outcome("call-3"));
        model.push_invoke(grade_outcome("no"));
        model.push_stream(vec!["抱歉，没有找到相关内容，请重新表述您的问题。"]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            None,
            quiet_config(),
        );

        let (run, events) =
            run_and_collect(&graph, "u1", "s1", "Summarize the constitution").await;

        assert!(run.no_relevant_found);
        assert!(run.retrieved_docs.is_empty());
        assert!(run.answer.contains("没有找到"));

        let rewrite_count = run
            .thinking
            .iter()
            .filter(|step| step.action == "rewrite_question")
            .count();
        assert_eq!(rewrite_count, 2, "budget allows max_retry_count - 1 rewrites");

        match events.last() {
            Some(GraphEvent::Complete { retrieved_docs, .. }) => {
                assert!(retrieved_docs.is_empty());
            }
            other => panic!("expected complete event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_count_resets_for_each_request_on_the_same_thread() {
        let retriever = seeded_retriever("u1", &[]).await;
        let checkpoint = Arc::new(CheckpointStore::memory());
        let model = Arc::new(ScriptedChatModel::new());

        // First run: exhaust the budget
        for _ in 0..2 {
            model.push_invoke(tool_call_outcome("c"));
            model.push_invoke(grade_outcome("no"));
            model.push_invoke(ChatOutcome {
                content: "rewrite".to_string(),
                ..ChatOutcome::default()
            });
        }
        model.push_invoke(tool_call_outcome("c"));
        model.push_invoke(grade_outcome("no"));
        model.push_stream(vec!["nothing found"]);

        // Second run on the same thread: the budget must be fresh, so a
        // grade of "no" must route to rewrite again
        model.push_invoke(tool_call_outcome("c"));
        model.push_invoke(grade_outcome("no"));
        model.push_invoke(ChatOutcome {
            content: "fresh rewrite".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(tool_call_outcome("c"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["eventual answer"]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            Some(Arc::clone(&checkpoint)),
            quiet_config(),
        );

        let (first, _) = run_and_collect(&graph, "u1", "s1", "first question").await;
        assert!(first.no_relevant_found);

        let (second, _) = run_and_collect(&graph, "u1", "s1", "second question").await;
        let rewrites = second
            .thinking
            .iter()
            .filter(|step| step.action == "rewrite_question")
            .count();
        assert_eq!(
            rewrites, 1,
            "a fresh request must have a fresh rewrite budget"
        );
    }

    #[tokio::test]
    async fn broken_tool_pairing_in_history_is_repaired_before_the_model_call() {
        let retriever = seeded_retriever("u1", &["Some document text."]).await;
        let checkpoint = Arc::new(CheckpointStore::memory());

        // Seed: assistant calls "abc" but the tool message answers "xyz"
        let broken = vec![
            ChatTurn::user("earlier question"),
            ChatTurn::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "abc".to_string(),
                    name: RETRIEVE_TOOL_NAME.to_string(),
                    arguments: "{}".to_string(),
                }],
            ),
            ChatTurn::tool("orphan result", "xyz"),
        ];
        checkpoint
            .save(&Checkpoint::thread_id("u1", "s1"), "u1", &broken)
            .await
            .expect("seed checkpoint");

        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["answer"]);

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            Some(checkpoint),
            quiet_config(),
        );

        let (_run, _events) = run_and_collect(&graph, "u1", "s1", "next question").await;

        let log = model.invoke_log.lock().expect("invoke log");
        let first_request = &log[0];

        // Every assistant tool call in the outbound request is matched by
        // exactly one following tool message
        for (index, turn) in first_request.messages.iter().enumerate() {
            for call in &turn.tool_calls {
                let answered = first_request.messages[index + 1..]
                    .iter()
                    .take_while(|t| t.role == ChatRole::Tool)
                    .filter(|t| t.tool_call_id.as_deref() == Some(call.id.as_str()))
                    .count();
                assert_eq!(answered, 1, "unmatched tool call {} sent to model", call.id);
            }
        }
        assert!(
            !first_request
                .messages
                .iter()
                .any(|turn| turn.tool_call_id.as_deref() == Some("xyz")),
            "orphan tool message must be dropped"
        );
    }

    #[tokio::test]
    async fn long_history_is_summarized_before_query_or_respond() {
        let retriever = seeded_retriever("u1", &["Some document text."]).await;
        let checkpoint = Arc::new(CheckpointStore::memory());

        let padding = "conversation padding ".repeat(60);
        let mut history = Vec::new();
        for i in 0..20 {
            history.push(ChatTurn::user(format!("q{i}: {padding}")));
            history.push(ChatTurn::assistant(format!("a{i}: {padding}")));
        }
        checkpoint
            .save(&Checkpoint::thread_id("u1", "s1"), "u1", &history)
            .await
            .expect("seed checkpoint");

        let model = Arc::new(ScriptedChatModel::new());
        model.push_invoke(ChatOutcome {
            content: "历史对话的总结。".to_string(),
            ..ChatOutcome::default()
        });
        model.push_invoke(tool_call_outcome("call-1"));
        model.push_invoke(grade_outcome("yes"));
        model.push_stream(vec!["answer"]);

        let config = GraphConfig {
            use_summarization: true,
            summarization_threshold: 500,
            summarization_keep: 6,
            summarization_max_tokens: 500,
            ..GraphConfig::default()
        };

        let graph = RetrievalGraph::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            retriever,
            Some(checkpoint),
            config,
        );

        let (run, _events) = run_and_collect(&graph, "u1", "s1", "turn 41").await;
        assert!(run
            .thinking
            .iter()
            .any(|step| step.action == "summarize_messages"));

        let log = model.invoke_log.lock().expect("invoke log");
        // log[0] is the summarizer; log[1] is query_or_respond
        let qor = &log[1];
        assert_eq!(qor.messages[0].role, ChatRole::System);
        assert_eq!(
            qor.messages[0].content.matches(SUMMARY_MARKER).count(),
            1,
            "exactly one summary section"
        );
        let non_system = qor
            .messages
            .iter()
            .filter(|turn| turn.role != ChatRole::System)
            .count();
        assert_eq!(non_system, 6, "only the kept tail goes to the model");
    }

    #[test]
    fn clean_rewrite_strips_prefixes_and_caps_length() {
        assert_eq!(
            clean_rewrite("Improved question: Who is Pelé?", "fallback"),
            "Who is Pelé?"
        );
        assert_eq!(
            clean_rewrite("改进后的问题：贝利是谁？", "fallback"),
            "贝利是谁？"
        );
        assert_eq!(
            clean_rewrite("first line\nsecond line", "fallback"),
            "first line"
        );
        assert_eq!(clean_rewrite("   ", "fallback"), "fallback");

        let long = format!("{}. {}", "w".repeat(150), "x".repeat(150));
        let cleaned = clean_rewrite(&long, "fallback");
        assert!(cleaned.chars().count() <= 200);
        assert!(cleaned.ends_with('.'), "falls back to the first sentence");

        let endless = "y".repeat(400);
        assert_eq!(clean_rewrite(&endless, "fallback").chars().count(), 200);
    }

    #[test]
    fn directive_is_inserted_or_prepended() {
        let mut empty: Vec<ChatTurn> = vec![ChatTurn::user("q")];
        ensure_retrieve_directive(&mut empty);
        assert_eq!(empty[0].role, ChatRole::System);
        assert!(empty[0].content.contains("retrieve_documents"));

        let mut with_summary = vec![
            ChatTurn::system(format!("{SUMMARY_MARKER}\nold summary")),
            ChatTurn::user("q"),
        ];
        ensure_retrieve_directive(&mut with_summary);
        assert!(with_summary[0].content.starts_with(RETRIEVE_FIRST_DIRECTIVE));
        assert!(with_summary[0].content.contains("old summary"));

        // idempotent
        let before = with_summary[0].content.clone();
        ensure_retrieve_directive(&mut with_summary);
        assert_eq!(with_summary[0].content, before);
    }
}
