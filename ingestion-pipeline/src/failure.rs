//! Ingestion failure kinds.
//!
//! Stage errors are tagged with a stable snake_case kind so the document
//! row's `error_message` stays machine-readable after truncation.

use common::error::AppError;

pub const UNSUPPORTED_FILE_TYPE: &str = "unsupported_file_type";
pub const FILE_TOO_LARGE: &str = "file_too_large";
pub const BLOB_DOWNLOAD_FAILED: &str = "blob_download_failed";
pub const PARSE_FAILED: &str = "parse_failed";
pub const EMPTY_DOCUMENT: &str = "empty_document";
pub const EMBED_FAILED: &str = "embed_failed";
pub const VECTOR_UPSERT_FAILED: &str = "vector_upsert_failed";

/// Wrap a stage error with its kind tag.
pub fn tagged(kind: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Processing(format!("{kind}: {detail}"))
}
