#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod failure;
pub mod pipeline;
pub mod utils;

use serde::{Deserialize, Serialize};

pub use pipeline::{IngestionConfig, IngestionPipeline, IngestionTuning};

/// Process-job payload posted by the gateway to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRequest {
    pub user_id: String,
    pub doc_id: String,
    #[serde(rename = "filepath")]
    pub storage_path: String,
    pub file_type: String,
    #[serde(default)]
    pub original_filename: String,
}

impl ProcessRequest {
    /// Display name for chunk metadata; falls back to the blob's basename
    /// when the caller omitted one.
    pub fn display_filename(&self) -> String {
        if !self.original_filename.is_empty() {
            return self.original_filename.clone();
        }
        self.storage_path
            .rsplit('/')
            .next()
            .unwrap_or(self.storage_path.as_str())
            .to_string()
    }
}
