use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum WorkerError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<AppError> for WorkerError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            other => {
                tracing::error!("Internal worker error: {:?}", other);
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InternalError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, message.clone()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
        };

        (
            status,
            Json(serde_json::json!({ "error": message, "status": "error" })),
        )
            .into_response()
    }
}
