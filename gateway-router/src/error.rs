use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum GatewayError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl From<AppError> for GatewayError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Database(_) | AppError::OpenAI(_) => {
                tracing::error!("Internal error: {:?}", err);
                Self::InternalError("Internal server error".to_string())
            }
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::Auth(msg) => Self::Forbidden(msg),
            AppError::Reqwest(err) => {
                tracing::error!("Worker call failed: {:?}", err);
                Self::WorkerUnavailable("RAG worker did not respond".to_string())
            }
            _ => Self::InternalError("Internal server error".to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Self::InternalError(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::ValidationError(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::PayloadTooLarge(message) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
            Self::WorkerUnavailable(message) => (
                StatusCode::BAD_GATEWAY,
                ErrorResponse {
                    error: message,
                    status: "error".to_string(),
                },
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: GatewayError) -> StatusCode {
        error.into_response().status()
    }

    #[test]
    fn maps_app_errors() {
        assert!(matches!(
            GatewayError::from(AppError::NotFound("missing".into())),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayError::from(AppError::Validation("bad".into())),
            GatewayError::ValidationError(_)
        ));
        assert!(matches!(
            GatewayError::from(AppError::Auth("nope".into())),
            GatewayError::Forbidden(_)
        ));
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            status_of(GatewayError::InternalError("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(GatewayError::ValidationError("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GatewayError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(GatewayError::Unauthorized("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(GatewayError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(GatewayError::PayloadTooLarge("x".into())),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_of(GatewayError::WorkerUnavailable("x".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn internal_error_message_is_sanitized() {
        let error = GatewayError::InternalError("db password wrong".to_string());
        assert_eq!(error.to_string(), "Internal server error");
    }
}
