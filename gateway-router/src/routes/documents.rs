use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use bytes::Bytes;
use common::storage::{
    store::object_location,
    types::{
        document::{Document, DocumentStatus},
        parent_block::ParentBlock,
        user::User,
    },
};
use ingestion_pipeline::ProcessRequest;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{error::GatewayError, state::GatewayState};

/// Extensions the ingestion pipeline can handle.
const ALLOWED_EXTENSIONS: [&str; 4] = ["pdf", "txt", "md", "docx"];

#[derive(Debug, Deserialize)]
pub struct UploadIntentBody {
    pub filename: String,
    pub file_size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn file_extension(filename: &str) -> Result<String, GatewayError> {
    let extension = filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .map(str::to_lowercase)
        .unwrap_or_default();

    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(GatewayError::ValidationError(format!(
            "unsupported_file_type: .{extension}"
        )));
    }
    Ok(extension)
}

fn status_label(status: &DocumentStatus) -> &'static str {
    match status {
        DocumentStatus::Processing => "processing",
        DocumentStatus::Active => "active",
        DocumentStatus::Error => "error",
        DocumentStatus::Deleted => "deleted",
    }
}

fn document_json(document: &Document) -> serde_json::Value {
    json!({
        "doc_id": document.id,
        "filename": document.original_filename,
        "status": status_label(&document.status),
        "chunk_count": document.chunk_count,
        "file_size": document.file_size,
        "file_type": document.file_type,
        "page_count": document.page_count,
        "error_message": document.error_message,
        "upload_at": document.created_at,
    })
}

/// Validate an upload intent and create the `processing` metadata row.
async fn create_upload_intent(
    state: &GatewayState,
    user: &User,
    body: &UploadIntentBody,
) -> Result<Document, GatewayError> {
    let extension = file_extension(&body.filename)?;

    if body.file_size > state.config.max_file_size {
        return Err(GatewayError::PayloadTooLarge(format!(
            "file_too_large: {} bytes exceeds the limit of {}",
            body.file_size, state.config.max_file_size
        )));
    }

    let storage_path = object_location(&user.id, &body.filename);
    let document = Document::new(
        user.id.clone(),
        body.filename.clone(),
        storage_path,
        body.file_size,
        extension,
    );

    state
        .db
        .store_item(document.clone())
        .await
        .map_err(common::error::AppError::Database)?;

    Ok(document)
}

pub async fn list_documents(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
) -> Result<impl IntoResponse, GatewayError> {
    let documents = Document::list_for_user(&user.id, &state.db).await?;
    let body: Vec<_> = documents.iter().map(document_json).collect();
    Ok(Json(body))
}

pub async fn upload_url(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Json(body): Json<UploadIntentBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let document = create_upload_intent(&state, &user, &body).await?;

    Ok(Json(json!({
        "upload_url": format!("/api/documents/{}/content", document.id),
        "doc_id": document.id,
        "status": "processing",
    })))
}

/// Resumable-upload bootstrap. With the local blob store the endpoint is
/// the gateway's own chunked PUT; a cloud deployment substitutes the
/// object store's upload endpoint here.
pub async fn tus_init(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Json(body): Json<UploadIntentBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let document = create_upload_intent(&state, &user, &body).await?;

    Ok(Json(json!({
        "endpoint": format!("/api/documents/{}/content", document.id),
        "bucket": "local",
        "object_name": document.storage_path,
        "doc_id": document.id,
        "max_file_size": state.config.max_file_size,
    })))
}

/// Brokered byte upload. Oversized bodies hard-delete the intent row:
/// the rollback path is the one place a document row is removed outright.
pub async fn put_content(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(doc_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    let document = Document::get_owned(&doc_id, &user.id, &state.db).await?;

    if document.status != DocumentStatus::Processing {
        return Err(GatewayError::ValidationError(
            "Document is not awaiting upload".to_string(),
        ));
    }

    if body.len() as u64 > state.config.max_file_size {
        Document::hard_delete(&doc_id, &state.db).await?;
        return Err(GatewayError::PayloadTooLarge(format!(
            "file_too_large: {} bytes exceeds the limit of {}",
            body.len(),
            state.config.max_file_size
        )));
    }

    let digest = format!("{:x}", Sha256::digest(&body));

    state
        .storage
        .put(&document.storage_path, body)
        .await
        .map_err(|err| {
            warn!(doc_id = %doc_id, error = %err, "blob write failed");
            GatewayError::InternalError("Failed to store the uploaded file".to_string())
        })?;

    Document::set_sha256(&doc_id, digest, &state.db).await?;

    Ok(Json(json!({ "doc_id": doc_id, "status": "uploaded" })))
}

pub async fn confirm_upload(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let document = Document::get_owned(&doc_id, &user.id, &state.db).await?;

    let exists = state
        .storage
        .exists(&document.storage_path)
        .await
        .unwrap_or(false);
    if !exists {
        return Err(GatewayError::ValidationError(
            "No uploaded object found for this document".to_string(),
        ));
    }

    let request = ProcessRequest {
        user_id: user.id.clone(),
        doc_id: document.id.clone(),
        storage_path: document.storage_path.clone(),
        file_type: document.file_type.clone(),
        original_filename: document.original_filename.clone(),
    };
    state.worker.dispatch_process(&request).await?;

    info!(doc_id = %doc_id, user_id = %user.id, "process job dispatched");

    Ok(Json(json!({ "doc_id": doc_id, "status": "processing" })))
}

pub async fn document_status(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let document = Document::get_owned(&doc_id, &user.id, &state.db).await?;

    Ok(Json(json!({
        "doc_id": document.id,
        "status": status_label(&document.status),
        "chunk_count": document.chunk_count,
        "error_message": document.error_message,
    })))
}

/// Soft-delete the row, then clear vectors, the parent map, and the blob.
pub async fn delete_document(
    State(state): State<GatewayState>,
    Extension(user): Extension<User>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let document = Document::get_owned(&doc_id, &user.id, &state.db).await?;

    Document::mark_deleted(&doc_id, &state.db).await?;

    if let Err(err) = state.worker.delete_vectors(&user.id, &doc_id).await {
        warn!(doc_id = %doc_id, error = %err, "vector cleanup failed; sweep will catch it");
    }
    ParentBlock::delete_for_document(&user.id, &doc_id, &state.db).await?;

    if let Err(err) = state.storage.delete(&document.storage_path).await {
        warn!(doc_id = %doc_id, error = %err, "blob cleanup failed");
    }

    Ok((StatusCode::OK, Json(json!({ "success": true }))))
}
