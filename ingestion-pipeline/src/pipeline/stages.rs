use common::{
    error::AppError,
    storage::types::{
        child_chunk::ChildChunk,
        parent_block::{ParentBlock, ParentMetadata},
    },
};
use state_machines::core::GuardError;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, instrument};

use crate::{
    failure::{self, tagged},
    utils::{cleaner::clean_text, extraction::extract_text, splitter::split_to_parent_child},
};

use super::{
    context::PipelineContext,
    state::{
        Cleaned, Extracted, Finalized, IngestionMachine, ParentsPersisted, Ready, Split, Upserted,
    },
};

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub async fn extract(
    machine: IngestionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Extracted>, AppError> {
    let bytes = ctx.services.fetch_blob(&ctx.request.storage_path).await?;

    let file_type = ctx.request.file_type.to_lowercase();
    let extracted = tokio::task::spawn_blocking(move || extract_text(&bytes, &file_type)).await??;

    info!(
        doc_id = %ctx.request.doc_id,
        text_chars = extracted.text.chars().count(),
        page_count = extracted.page_count,
        "document text extracted"
    );

    ctx.extracted = Some(extracted);

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub fn clean(
    machine: IngestionMachine<(), Extracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Cleaned>, AppError> {
    let extracted = ctx
        .extracted
        .as_ref()
        .ok_or_else(|| AppError::InternalError("clean stage entered without extraction".into()))?;

    let cleaned = clean_text(&extracted.text);
    if cleaned.is_empty() {
        return Err(tagged(
            failure::EMPTY_DOCUMENT,
            "no extractable text after cleaning",
        ));
    }

    debug!(
        doc_id = %ctx.request.doc_id,
        cleaned_chars = cleaned.chars().count(),
        "document text cleaned"
    );

    ctx.cleaned = Some(cleaned);

    machine
        .clean()
        .map_err(|(_, guard)| map_guard_error("clean", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub fn split(
    machine: IngestionMachine<(), Cleaned>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Split>, AppError> {
    let cleaned = ctx
        .cleaned
        .as_ref()
        .ok_or_else(|| AppError::InternalError("split stage entered without cleaned text".into()))?;

    let (parents, children) = split_to_parent_child(
        cleaned,
        ctx.config.parent_chunk_size,
        ctx.config.child_chunk_size,
    );

    info!(
        doc_id = %ctx.request.doc_id,
        parents = parents.len(),
        children = children.len(),
        "document split into parent/child chunks"
    );

    ctx.parents = parents;
    ctx.children = children;

    machine
        .split()
        .map_err(|(_, guard)| map_guard_error("split", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub async fn persist_parents(
    machine: IngestionMachine<(), Split>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), ParentsPersisted>, AppError> {
    let blocks: Vec<ParentBlock> = ctx
        .parents
        .iter()
        .map(|parent| {
            ParentBlock::new(
                parent.parent_id.clone(),
                ctx.request.doc_id.clone(),
                ctx.request.user_id.clone(),
                parent.content.clone(),
                ParentMetadata {
                    source: ctx.request.display_filename(),
                    title: None,
                },
            )
        })
        .collect();

    ParentBlock::replace_for_document(&ctx.request.user_id, &ctx.request.doc_id, blocks, ctx.db)
        .await?;

    debug!(
        doc_id = %ctx.request.doc_id,
        parents = ctx.parents.len(),
        "parent map rewritten"
    );

    machine
        .persist_parents()
        .map_err(|(_, guard)| map_guard_error("persist_parents", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub async fn embed_and_upsert(
    machine: IngestionMachine<(), ParentsPersisted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Upserted>, AppError> {
    // Sweep any chunks from a previous run before writing; combined with
    // deterministic chunk ids this makes re-ingestion idempotent.
    ChildChunk::delete_for_document(&ctx.request.user_id, &ctx.request.doc_id, ctx.db)
        .await
        .map_err(|err| tagged(failure::VECTOR_UPSERT_FAILED, err))?;

    let batch_size = ctx.config.embed_batch_size.max(1);
    let total_batches = ctx.children.len().div_ceil(batch_size);

    for (batch_index, batch) in ctx.children.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|child| child.content.clone()).collect();

        let retry_strategy = ExponentialBackoff::from_millis(ctx.config.tuning.embed_retry_base_ms)
            .map(jitter)
            .take(ctx.config.tuning.embed_retry_attempts);
        let embeddings = Retry::spawn(retry_strategy, || ctx.services.embed_batch(&texts))
            .await
            .map_err(|err| tagged(failure::EMBED_FAILED, err))?;

        if embeddings.len() != batch.len() {
            return Err(tagged(
                failure::EMBED_FAILED,
                format!(
                    "embedder returned {} vectors for {} chunks",
                    embeddings.len(),
                    batch.len()
                ),
            ));
        }

        let rows: Vec<ChildChunk> = batch
            .iter()
            .zip(embeddings)
            .map(|(child, embedding)| {
                ChildChunk::new(
                    ctx.request.doc_id.clone(),
                    child.parent_id.clone(),
                    ctx.request.user_id.clone(),
                    child.chunk_id,
                    child.content.clone(),
                    ctx.request.display_filename(),
                    embedding,
                )
            })
            .collect();

        let row_count = rows.len();
        ChildChunk::upsert_batch(rows, ctx.db)
            .await
            .map_err(|err| tagged(failure::VECTOR_UPSERT_FAILED, err))?;

        ctx.upserted_chunks = ctx
            .upserted_chunks
            .saturating_add(u32::try_from(row_count).unwrap_or(u32::MAX));

        info!(
            doc_id = %ctx.request.doc_id,
            batch = batch_index.saturating_add(1),
            total_batches,
            batch_chunks = row_count,
            "embedded and upserted chunk batch"
        );
    }

    machine
        .upsert()
        .map_err(|(_, guard)| map_guard_error("upsert", &guard))
}

#[instrument(
    level = "trace",
    skip_all,
    fields(doc_id = %ctx.request.doc_id, user_id = %ctx.request.user_id)
)]
pub async fn finalize(
    machine: IngestionMachine<(), Upserted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Finalized>, AppError> {
    common::storage::types::document::Document::mark_active(
        &ctx.request.doc_id,
        ctx.upserted_chunks,
        ctx.page_count(),
        ctx.db,
    )
    .await?;

    info!(
        doc_id = %ctx.request.doc_id,
        chunk_count = ctx.upserted_chunks,
        "document activated"
    );

    machine
        .finalize()
        .map_err(|(_, guard)| map_guard_error("finalize", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}
