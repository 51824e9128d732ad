use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::store::StorageManager,
    utils::embedding::EmbeddingProvider,
};

use crate::failure::{self, tagged};

/// I/O boundary of the pipeline. Tests swap in stubs; production wires the
/// blob store and the process-wide embedding provider.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn fetch_blob(&self, location: &str) -> Result<Bytes, AppError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

#[allow(clippy::module_name_repetitions)]
pub struct DefaultPipelineServices {
    storage: StorageManager,
    embedding_provider: Arc<EmbeddingProvider>,
}

impl DefaultPipelineServices {
    pub fn new(storage: StorageManager, embedding_provider: Arc<EmbeddingProvider>) -> Self {
        Self {
            storage,
            embedding_provider,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn fetch_blob(&self, location: &str) -> Result<Bytes, AppError> {
        self.storage
            .get(location)
            .await
            .map_err(|err| tagged(failure::BLOB_DOWNLOAD_FAILED, err))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedding_provider.embed_batch(texts).await
    }
}
