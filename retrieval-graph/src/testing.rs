//! Scripted model for graph tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use common::error::AppError;
use futures::stream;

use crate::llm::{ChatModel, ChatOutcome, ChatRequest, TokenStream};

/// Plays back queued outcomes and streams in FIFO order; records every
/// request for assertions.
pub struct ScriptedChatModel {
    invocations: Mutex<VecDeque<ChatOutcome>>,
    streams: Mutex<VecDeque<Vec<String>>>,
    pub invoke_log: Mutex<Vec<ChatRequest>>,
    pub stream_log: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatModel {
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            invoke_log: Mutex::new(Vec::new()),
            stream_log: Mutex::new(Vec::new()),
        }
    }

    pub fn push_invoke(&self, outcome: ChatOutcome) {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push_back(outcome);
    }

    pub fn push_stream(&self, chunks: Vec<&str>) {
        self.streams
            .lock()
            .expect("streams lock")
            .push_back(chunks.into_iter().map(str::to_owned).collect());
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn invoke(&self, request: ChatRequest) -> Result<ChatOutcome, AppError> {
        self.invoke_log
            .lock()
            .expect("invoke log lock")
            .push(request);
        self.invocations
            .lock()
            .expect("invocations lock")
            .pop_front()
            .ok_or_else(|| AppError::InternalError("scripted model ran out of invocations".into()))
    }

    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, AppError> {
        self.stream_log
            .lock()
            .expect("stream log lock")
            .push(request);
        let chunks = self
            .streams
            .lock()
            .expect("streams lock")
            .pop_front()
            .ok_or_else(|| AppError::InternalError("scripted model ran out of streams".into()))?;

        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}
