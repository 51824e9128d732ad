use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use common::storage::types::{child_chunk::ChildChunk, parent_block::ParentBlock};
use ingestion_pipeline::ProcessRequest;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::{error::WorkerError, state::WorkerState};

/// Kick off ingestion in the background; status lands on the document row.
pub async fn process_document(
    State(state): State<WorkerState>,
    Path(doc_id): Path<String>,
    Json(request): Json<ProcessRequest>,
) -> Result<impl IntoResponse, WorkerError> {
    if request.doc_id != doc_id {
        return Err(WorkerError::ValidationError(
            "doc_id in path and body must match".to_string(),
        ));
    }
    if request.user_id.trim().is_empty() || request.storage_path.trim().is_empty() {
        return Err(WorkerError::ValidationError(
            "user_id and filepath are required".to_string(),
        ));
    }

    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(err) = pipeline.process_document(request).await {
            error!(%doc_id, error = %err, "background ingestion failed");
        }
    });

    Ok(Json(json!({ "success": true, "status": "processing" })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteVectorsParams {
    pub user_id: String,
}

/// Remove a document's chunks and parent map for one tenant.
pub async fn delete_vectors(
    State(state): State<WorkerState>,
    Path(doc_id): Path<String>,
    Query(params): Query<DeleteVectorsParams>,
) -> Result<impl IntoResponse, WorkerError> {
    ChildChunk::delete_for_document(&params.user_id, &doc_id, &state.db).await?;
    ParentBlock::delete_for_document(&params.user_id, &doc_id, &state.db).await?;

    info!(%doc_id, user_id = %params.user_id, "vectors and parent map deleted");

    Ok(Json(json!({ "success": true })))
}
