#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Agentic retrieval runtime: a state-machine loop that retrieves with a
//! bound tool, grades relevance, rewrites bounded times, summarizes long
//! histories, and streams grounded answers.

pub mod checkpoint;
pub mod events;
pub mod llm;
pub mod messages;
pub mod prompts;
pub mod reranking;
pub mod retriever;
pub mod runtime;
pub mod state;
pub mod summarize;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::CheckpointStore;
pub use events::{GraphEvent, ThinkingStep};
pub use llm::{ChatModel, LlmSettings, OpenAiChatModel, RETRIEVE_TOOL_NAME};
pub use retriever::{Retriever, RetrieverConfig, RetrievedDoc, NO_RELEVANT_DOCUMENTS};
pub use runtime::{GraphConfig, GraphRun, RetrievalGraph};
