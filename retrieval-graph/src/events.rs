//! Events emitted by a graph run, serialized onto the SSE stream.

use serde::Serialize;

use crate::retriever::RetrievedDoc;

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingStep {
    pub step: u32,
    pub action: String,
    pub description: String,
    pub details: serde_json::Value,
}

/// Wire events. `thinking` and `chunk` stream during the run; exactly one
/// of `complete` or `error` terminates it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphEvent {
    Thinking {
        data: Vec<ThinkingStep>,
        session_id: String,
    },
    Chunk {
        content: String,
        session_id: String,
    },
    Complete {
        answer: String,
        retrieved_docs: Vec<RetrievedDoc>,
        thinking_process: Vec<ThinkingStep>,
        tokens_used: u64,
        session_id: String,
    },
    Error {
        message: String,
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = GraphEvent::Chunk {
            content: "Par".to_string(),
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["content"], "Par");
        assert_eq!(json["session_id"], "s1");

        let complete = GraphEvent::Complete {
            answer: "Paris".to_string(),
            retrieved_docs: Vec::new(),
            thinking_process: Vec::new(),
            tokens_used: 42,
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_value(&complete).expect("serialize");
        assert_eq!(json["type"], "complete");
        assert_eq!(json["tokens_used"], 42);
    }
}
