use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::WorkerState;

/// Warmup/readiness flags for probes.
pub async fn health(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "embedder_ready": state.embedding_provider.is_ready(),
        "embedding_backend": state.embedding_provider.backend_label(),
        "reranker_ready": state.graph.reranker_ready(),
    }))
}
