#![allow(clippy::missing_docs_in_private_items)]

//! Public HTTP surface: auth, document lifecycle, chat brokering. The
//! gateway owns metadata and blobs; retrieval and ingestion happen on the
//! worker.

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};

pub mod error;
pub mod middleware_auth;
pub mod routes;
pub mod state;
pub mod worker_client;

use middleware_auth::bearer_auth;
use state::GatewayState;

/// Gateway API router; callers nest it under `/api`.
pub fn gateway_routes<S>(app_state: &GatewayState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    GatewayState: FromRef<S>,
{
    // Unauthenticated endpoints
    let public = Router::new()
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login));

    // Raw uploads need a body limit above the configured max so the
    // explicit file_too_large check can answer before axum's own cap.
    let upload_limit = usize::try_from(app_state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    let protected = Router::new()
        .route("/auth/me", get(routes::auth::me))
        .route("/documents", get(routes::documents::list_documents))
        .route("/documents/upload-url", post(routes::documents::upload_url))
        .route("/documents/tus-init", post(routes::documents::tus_init))
        .route(
            "/documents/{doc_id}/content",
            put(routes::documents::put_content).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/documents/{doc_id}/confirm-upload",
            post(routes::documents::confirm_upload),
        )
        .route(
            "/documents/{doc_id}/status",
            get(routes::documents::document_status),
        )
        .route(
            "/documents/{doc_id}",
            delete(routes::documents::delete_document),
        )
        .route("/chat/message", post(routes::chat::post_message))
        .route("/chat/stream", post(routes::chat::stream_message))
        .route("/chat/sessions", get(routes::chat::list_sessions))
        .route(
            "/chat/sessions/{session_id}/messages",
            get(routes::chat::session_messages),
        )
        .route(
            "/chat/sessions/{session_id}",
            delete(routes::chat::delete_session),
        )
        .route(
            "/chat/messages/{message_id}",
            delete(routes::chat::delete_message),
        )
        .route_layer(from_fn_with_state(app_state.clone(), bearer_auth));

    public.merge(protected)
}
