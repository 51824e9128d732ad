#![allow(clippy::missing_docs_in_private_items)]

//! Internal worker surface: ingestion jobs, the retrieval graph, vector
//! cleanup, health probes. The gateway is its only intended caller.

use axum::{
    extract::FromRef,
    routing::{delete, get, post},
    Router,
};

pub mod error;
pub mod routes;
pub mod state;

use state::WorkerState;

pub fn worker_routes<S>(_app_state: &WorkerState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    WorkerState: FromRef<S>,
{
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/chat/message", post(routes::chat::post_message))
        .route("/api/chat/stream", post(routes::chat::stream_message))
        .route(
            "/api/documents/{doc_id}/process",
            post(routes::documents::process_document),
        )
        .route(
            "/api/documents/{doc_id}/delete-vectors",
            delete(routes::documents::delete_vectors),
        )
}
