#![allow(clippy::missing_docs_in_private_items)]

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChildChunk, "child_chunk", {
    doc_id: String,
    parent_id: String,
    user_id: String,
    chunk_id: u32,
    content: String,
    source: String,
    embedding: Vec<f32>
});

/// Search result including the fetched chunk and its score.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSearchResult {
    pub chunk: ChildChunk,
    pub score: f32,
}

const UPSERT_BATCH: &str = r"
    BEGIN TRANSACTION;
    FOR $chunk IN $chunks {
        UPSERT type::thing('child_chunk', $chunk.id) CONTENT $chunk;
    };
    COMMIT TRANSACTION;
";

impl ChildChunk {
    /// Deterministic record id so re-ingesting a document overwrites its
    /// chunks in place instead of duplicating them.
    pub fn deterministic_id(doc_id: &str, chunk_id: u32) -> String {
        format!("{doc_id}_{chunk_id}")
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        doc_id: String,
        parent_id: String,
        user_id: String,
        chunk_id: u32,
        content: String,
        source: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::deterministic_id(&doc_id, chunk_id),
            created_at: now,
            updated_at: now,
            doc_id,
            parent_id,
            user_id,
            chunk_id,
            content,
            source,
            embedding,
        }
    }

    /// Upsert one embed-batch of chunks in a single transaction.
    pub async fn upsert_batch(chunks: Vec<ChildChunk>, db: &SurrealDbClient) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let response = db
            .client
            .query(UPSERT_BATCH)
            .bind(("chunks", chunks))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Remove every chunk of one document. The `user_id` filter is part of
    /// the tenant-isolation contract, never optional.
    pub async fn delete_for_document(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE child_chunk WHERE user_id = $user_id AND doc_id = $doc_id")
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn count_for_document(
        user_id: &str,
        doc_id: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM child_chunk
                 WHERE user_id = $user_id AND doc_id = $doc_id
                 GROUP ALL",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?;

        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count))
    }

    /// Dense top-K over the HNSW index, scoped to one user.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            #[serde(deserialize_with = "deserialize_datetime")]
            created_at: DateTime<Utc>,
            #[serde(deserialize_with = "deserialize_datetime")]
            updated_at: DateTime<Utc>,
            doc_id: String,
            parent_id: String,
            user_id: String,
            chunk_id: u32,
            content: String,
            source: String,
            embedding: Vec<f32>,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                *,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {table}
            WHERE user_id = $user_id
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take};
            "#,
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("user_id", user_id.to_owned()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| ChunkSearchResult {
                chunk: ChildChunk {
                    id: r.id,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                    doc_id: r.doc_id,
                    parent_id: r.parent_id,
                    user_id: r.user_id,
                    chunk_id: r.chunk_id,
                    content: r.content,
                    source: r.source,
                    embedding: r.embedding,
                },
                score: r.score,
            })
            .collect())
    }

    /// BM25 top-K over the full-text index, scoped to one user. The caller
    /// pre-segments CJK queries into whitespace-separated terms.
    pub async fn fts_search(
        take: usize,
        terms: &str,
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            #[serde(deserialize_with = "deserialize_datetime")]
            created_at: DateTime<Utc>,
            #[serde(deserialize_with = "deserialize_datetime")]
            updated_at: DateTime<Utc>,
            doc_id: String,
            parent_id: String,
            user_id: String,
            chunk_id: u32,
            content: String,
            source: String,
            embedding: Vec<f32>,
            score: f32,
        }

        let limit = i64::try_from(take).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            SELECT
                *,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM {table}
            WHERE content @0@ $terms
              AND user_id = $user_id
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("user_id", user_id.to_owned()))
            .bind(("limit", limit))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        response = response.check().map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| ChunkSearchResult {
                chunk: ChildChunk {
                    id: r.id,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                    doc_id: r.doc_id,
                    parent_id: r.parent_id,
                    user_id: r.user_id,
                    chunk_id: r.chunk_id,
                    content: r.content,
                    source: r.source,
                    embedding: r.embedding,
                },
                score: r.score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db(dimension: usize) -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(dimension)
            .await
            .expect("initialize schema");
        db
    }

    fn chunk(doc_id: &str, user_id: &str, chunk_id: u32, content: &str, embedding: Vec<f32>) -> ChildChunk {
        ChildChunk::new(
            doc_id.to_string(),
            "parent-1".to_string(),
            user_id.to_string(),
            chunk_id,
            content.to_string(),
            "report.pdf".to_string(),
            embedding,
        )
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_doc_and_chunk() {
        let db = test_db(3).await;

        let first = vec![
            chunk("d1", "u1", 0, "first body", vec![1.0, 0.0, 0.0]),
            chunk("d1", "u1", 1, "second body", vec![0.0, 1.0, 0.0]),
        ];
        ChildChunk::upsert_batch(first, &db).await.expect("upsert");
        ChildChunk::upsert_batch(
            vec![
                chunk("d1", "u1", 0, "first body reprocessed", vec![1.0, 0.0, 0.0]),
                chunk("d1", "u1", 1, "second body reprocessed", vec![0.0, 1.0, 0.0]),
            ],
            &db,
        )
        .await
        .expect("second upsert");

        assert_eq!(
            ChildChunk::count_for_document("u1", "d1", &db)
                .await
                .expect("count"),
            2,
            "re-ingestion must not duplicate chunks"
        );
    }

    #[tokio::test]
    async fn test_vector_search_filters_by_user() {
        let db = test_db(3).await;

        ChildChunk::upsert_batch(
            vec![
                chunk("d1", "u1", 0, "tenant one chunk", vec![1.0, 0.0, 0.0]),
                chunk("d2", "u2", 0, "tenant two chunk", vec![1.0, 0.0, 0.0]),
            ],
            &db,
        )
        .await
        .expect("seed");

        let results = ChildChunk::vector_search(5, vec![1.0, 0.0, 0.0], &db, "u1")
            .await
            .expect("search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.user_id, "u1");
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let db = test_db(3).await;

        ChildChunk::upsert_batch(
            vec![
                chunk("d1", "u1", 0, "close match", vec![0.9, 0.1, 0.0]),
                chunk("d1", "u1", 1, "far match", vec![0.0, 0.0, 1.0]),
            ],
            &db,
        )
        .await
        .expect("seed");

        let results = ChildChunk::vector_search(2, vec![1.0, 0.0, 0.0], &db, "u1")
            .await
            .expect("search");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "close match");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_delete_for_document_leaves_other_docs() {
        let db = test_db(3).await;

        ChildChunk::upsert_batch(
            vec![
                chunk("d1", "u1", 0, "doomed", vec![1.0, 0.0, 0.0]),
                chunk("d2", "u1", 0, "survivor", vec![0.0, 1.0, 0.0]),
            ],
            &db,
        )
        .await
        .expect("seed");

        ChildChunk::delete_for_document("u1", "d1", &db)
            .await
            .expect("delete");

        assert_eq!(
            ChildChunk::count_for_document("u1", "d1", &db)
                .await
                .expect("count d1"),
            0
        );
        assert_eq!(
            ChildChunk::count_for_document("u1", "d2", &db)
                .await
                .expect("count d2"),
            1
        );
    }

    #[tokio::test]
    async fn test_fts_search_filters_by_user() {
        let db = test_db(3).await;

        ChildChunk::upsert_batch(
            vec![
                chunk("d1", "u1", 0, "the capital of france is paris", vec![1.0, 0.0, 0.0]),
                chunk("d2", "u2", 0, "paris is mentioned here too", vec![0.0, 1.0, 0.0]),
            ],
            &db,
        )
        .await
        .expect("seed");
        db.rebuild_indexes().await.expect("rebuild indexes");

        let results = ChildChunk::fts_search(5, "paris", &db, "u1")
            .await
            .expect("fts search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.user_id, "u1");
        assert!(results[0].score.is_finite());
    }

    #[test]
    fn test_deterministic_id() {
        assert_eq!(ChildChunk::deterministic_id("doc", 7), "doc_7");
        let a = chunk("doc", "u", 3, "x", vec![]);
        let b = chunk("doc", "u", 3, "y", vec![]);
        assert_eq!(a.id, b.id);
    }
}
