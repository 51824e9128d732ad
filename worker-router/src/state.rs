use std::sync::Arc;

use common::{
    storage::db::SurrealDbClient, utils::config::AppConfig, utils::embedding::EmbeddingProvider,
};
use ingestion_pipeline::IngestionPipeline;
use retrieval_graph::RetrievalGraph;

#[derive(Clone)]
pub struct WorkerState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub graph: Arc<RetrievalGraph>,
    pub pipeline: Arc<IngestionPipeline>,
    pub embedding_provider: Arc<EmbeddingProvider>,
}

impl WorkerState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        graph: Arc<RetrievalGraph>,
        pipeline: Arc<IngestionPipeline>,
        embedding_provider: Arc<EmbeddingProvider>,
    ) -> Self {
        Self {
            db,
            config,
            graph,
            pipeline,
            embedding_provider,
        }
    }
}
