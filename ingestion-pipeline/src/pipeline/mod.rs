mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, store::StorageManager, types::document::Document},
    utils::embedding::EmbeddingProvider,
};
use tracing::{info, warn};

use crate::ProcessRequest;

use self::{
    context::PipelineContext,
    stages::{clean, embed_and_upsert, extract, finalize, persist_parents, split},
    state::ready,
};

/// Drives one document from blob to active vectors.
///
/// Errors are captured at this boundary: the document row is flipped to
/// `error` with a bounded diagnostic and the job ends. Chat flows never see
/// ingestion failures.
#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedding_provider: Arc<EmbeddingProvider>,
        config: IngestionConfig,
    ) -> Self {
        let services = DefaultPipelineServices::new(storage, embedding_provider);
        Self::with_services(db, config, Arc::new(services))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            config,
            services,
        }
    }

    /// Process one document end to end, updating its status row.
    #[tracing::instrument(
        skip_all,
        fields(doc_id = %request.doc_id, user_id = %request.user_id, file_type = %request.file_type)
    )]
    pub async fn process_document(&self, request: ProcessRequest) -> Result<u32, AppError> {
        match self.drive_pipeline(&request).await {
            Ok(chunk_count) => Ok(chunk_count),
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    doc_id = %request.doc_id,
                    error = %reason,
                    "ingestion failed; marking document as errored"
                );
                if let Err(status_err) =
                    Document::mark_error(&request.doc_id, &reason, &self.db).await
                {
                    warn!(
                        doc_id = %request.doc_id,
                        error = %status_err,
                        "failed to record error status"
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive_pipeline(&self, request: &ProcessRequest) -> Result<u32, AppError> {
        let mut ctx = PipelineContext::new(
            self.db.as_ref(),
            self.services.as_ref(),
            &self.config,
            request,
        );

        let machine = ready();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = extract(machine, &mut ctx).await?;
        let extract_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = clean(machine, &mut ctx)?;
        let clean_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = split(machine, &mut ctx)?;
        let split_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = persist_parents(machine, &mut ctx).await?;
        let persist_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = embed_and_upsert(machine, &mut ctx).await?;
        let upsert_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = finalize(machine, &mut ctx).await?;
        let finalize_duration = stage_start.elapsed();

        info!(
            doc_id = %ctx.request.doc_id,
            total_ms = duration_millis(pipeline_started.elapsed()),
            extract_ms = duration_millis(extract_duration),
            clean_ms = duration_millis(clean_duration),
            split_ms = duration_millis(split_duration),
            persist_ms = duration_millis(persist_duration),
            upsert_ms = duration_millis(upsert_duration),
            finalize_ms = duration_millis(finalize_duration),
            chunk_count = ctx.upserted_chunks,
            "ingestion pipeline finished"
        );

        Ok(ctx.upserted_chunks)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
