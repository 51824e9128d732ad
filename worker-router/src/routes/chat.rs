use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use common::storage::types::{
    chat_message::{ChatMessage, MessageRole},
    chat_session::ChatSession,
};
use retrieval_graph::GraphEvent;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{error::WorkerError, state::WorkerState};

/// Buffered events between the graph task and the SSE writer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ChatDispatchBody {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
}

fn validate(body: &ChatDispatchBody) -> Result<(), WorkerError> {
    if body.user_id.trim().is_empty()
        || body.session_id.trim().is_empty()
        || body.message.trim().is_empty()
    {
        return Err(WorkerError::ValidationError(
            "user_id, session_id and message are required".to_string(),
        ));
    }
    Ok(())
}

/// Run the graph and persist the assistant turn. LLM failures leave no
/// partial assistant message behind.
async fn run_and_persist(
    state: WorkerState,
    user_id: String,
    session_id: String,
    message: String,
    events: mpsc::Sender<GraphEvent>,
) {
    match state
        .graph
        .run(&user_id, &session_id, &message, &events)
        .await
    {
        Ok(run) => {
            let assistant = ChatMessage::new(
                session_id.clone(),
                user_id.clone(),
                MessageRole::Assistant,
                run.answer,
            );
            if let Err(err) = state.db.store_item(assistant).await {
                error!(%session_id, error = %err, "failed to persist assistant turn");
            }
            if let Err(err) = ChatSession::touch(&session_id, &state.db).await {
                error!(%session_id, error = %err, "failed to touch session");
            }
            info!(%session_id, "assistant turn persisted");
        }
        Err(err) => {
            error!(%session_id, error = %err, "graph run failed");
            let _ = events
                .send(GraphEvent::Error {
                    message: err.to_string(),
                    session_id,
                })
                .await;
        }
    }
}

/// Fire-and-forget chat turn; the reply lands in the message store.
pub async fn post_message(
    State(state): State<WorkerState>,
    Json(body): Json<ChatDispatchBody>,
) -> Result<impl IntoResponse, WorkerError> {
    validate(&body)?;

    let session_id = body.session_id.clone();
    // No listener: event sends fail silently and the run still persists.
    let (events, _discarded) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(run_and_persist(
        state.clone(),
        body.user_id,
        body.session_id,
        body.message,
        events,
    ));

    Ok(Json(json!({ "success": true, "session_id": session_id })))
}

/// Streaming chat turn: thinking steps and token chunks as SSE, closed by
/// a `complete` or `error` event.
pub async fn stream_message(
    State(state): State<WorkerState>,
    Json(body): Json<ChatDispatchBody>,
) -> Result<impl IntoResponse, WorkerError> {
    validate(&body)?;

    let (events, mut receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(run_and_persist(
        state.clone(),
        body.user_id,
        body.session_id,
        body.message,
        events,
    ));

    let event_stream = stream! {
        while let Some(event) = receiver.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "failed to serialize graph event");
                    continue;
                }
            };
            let terminal = matches!(
                event,
                GraphEvent::Complete { .. } | GraphEvent::Error { .. }
            );
            yield Ok::<Event, Infallible>(Event::default().data(payload));
            if terminal {
                break;
            }
        }
    };

    let sse = Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );

    Ok((
        [
            ("Cache-Control", "no-cache"),
            ("X-Accel-Buffering", "no"),
        ],
        sse,
    ))
}
