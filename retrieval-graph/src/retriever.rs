//! Hybrid retrieval with parent projection and reranking.
//!
//! Dense HNSW results are fused with BM25 results by reciprocal rank when
//! the corpus is locally enumerable; matched children are projected to
//! their parent blocks so the model sees full context units; an optional
//! cross-encoder re-orders and thresholds the candidates.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Arc, Once, OnceLock};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            child_chunk::{ChildChunk, ChunkSearchResult},
            parent_block::ParentBlock,
        },
    },
    utils::{
        config::{AppConfig, VectorStoreMode},
        embedding::EmbeddingProvider,
    },
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::reranking::RerankBackend;

/// Sentinel returned when retrieval (or threshold filtering) leaves no
/// candidates. The grader routes this to the rewrite loop: asking again
/// with a better query beats answering on weak evidence.
pub const NO_RELEVANT_DOCUMENTS: &str = "No relevant documents found.";

/// RRF smoothing constant.
const RRF_C: f64 = 60.0;

static BM25_FALLBACK_WARNING: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub retrieval_k: usize,
    pub use_hybrid: bool,
    pub use_parent_child: bool,
    pub rerank_top_k: usize,
    pub rerank_top_n: usize,
    pub rerank_score_threshold: Option<f32>,
    /// BM25 needs a locally enumerable corpus; managed stores fall back to
    /// pure dense retrieval.
    pub store_is_local: bool,
}

impl RetrieverConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            retrieval_k: config.retrieval_k,
            use_hybrid: config.use_hybrid_retriever,
            use_parent_child: config.use_parent_child_strategy,
            rerank_top_k: config.rerank_top_k,
            rerank_top_n: config.rerank_top_n,
            rerank_score_threshold: config.rerank_score_threshold,
            store_is_local: config.vector_db_mode == VectorStoreMode::Local,
        }
    }
}

/// A candidate handed to the answerer, with provenance for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedDoc {
    pub content: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub doc_id: String,
}

pub struct Retriever {
    db: Arc<SurrealDbClient>,
    embedding_provider: Arc<EmbeddingProvider>,
    reranker: Option<RerankBackend>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedding_provider: Arc<EmbeddingProvider>,
        reranker: Option<RerankBackend>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            db,
            embedding_provider,
            reranker,
            config,
        }
    }

    pub fn reranker_ready(&self) -> bool {
        self.reranker.as_ref().is_none_or(RerankBackend::is_ready)
    }

    /// Run the full retrieval pass for one query. Returns the formatted
    /// tool output and the structured candidates behind it.
    #[tracing::instrument(skip_all, fields(%user_id))]
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<(String, Vec<RetrievedDoc>), AppError> {
        let k = self.config.retrieval_k.max(1);

        let query_embedding = self.embedding_provider.embed(query).await?;
        let dense = ChildChunk::vector_search(k, query_embedding, &self.db, user_id).await?;

        let sparse = if self.config.use_hybrid && self.config.store_is_local {
            self.sparse_search(user_id, query, k).await
        } else {
            Vec::new()
        };

        let fused = if sparse.is_empty() {
            dense
        } else {
            rrf_fuse(&[sparse, dense], k)
        };

        if fused.is_empty() {
            info!(%user_id, "retrieval produced no candidates");
            return Ok((NO_RELEVANT_DOCUMENTS.to_string(), Vec::new()));
        }

        let mut candidates = if self.config.use_parent_child {
            self.project_to_parents(user_id, &fused).await?
        } else {
            fused
                .iter()
                .map(|result| RetrievedDoc {
                    content: result.chunk.content.clone(),
                    source: result.chunk.source.clone(),
                    title: None,
                    rerank_score: None,
                    parent_id: Some(result.chunk.parent_id.clone()),
                    doc_id: result.chunk.doc_id.clone(),
                })
                .collect()
        };

        if let Some(reranker) = &self.reranker {
            candidates.truncate(self.config.rerank_top_k.max(1));
            let documents: Vec<String> = candidates
                .iter()
                .map(|candidate| candidate.content.clone())
                .collect();
            let scores = reranker.rerank(query, &documents).await?;
            candidates = apply_rerank(
                candidates,
                &scores,
                self.config.rerank_score_threshold,
                self.config.rerank_top_n,
            );

            if candidates.is_empty() {
                debug!(%user_id, "all candidates fell below the rerank threshold");
                return Ok((NO_RELEVANT_DOCUMENTS.to_string(), Vec::new()));
            }
        }

        let formatted = format_documents(&candidates);
        Ok((formatted, candidates))
    }

    async fn sparse_search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Vec<ChunkSearchResult> {
        let terms = segment_query(query);
        match ChildChunk::fts_search(k, &terms, &self.db, user_id).await {
            Ok(results) => results,
            Err(err) => {
                BM25_FALLBACK_WARNING.call_once(|| {
                    warn!(error = %err, "BM25 search unavailable, falling back to dense-only retrieval");
                });
                Vec::new()
            }
        }
    }

    /// Collect the unique parents of the fused children, in fused order.
    async fn project_to_parents(
        &self,
        user_id: &str,
        fused: &[ChunkSearchResult],
    ) -> Result<Vec<RetrievedDoc>, AppError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut parent_ids: Vec<String> = Vec::new();
        for result in fused {
            if seen.insert(result.chunk.parent_id.as_str()) {
                parent_ids.push(result.chunk.parent_id.clone());
            }
        }

        let blocks = ParentBlock::get_by_ids(user_id, &parent_ids, &self.db).await?;

        Ok(blocks
            .into_iter()
            .map(|block| RetrievedDoc {
                content: block.content,
                source: block.metadata.source,
                title: block.metadata.title,
                rerank_score: None,
                parent_id: Some(block.id),
                doc_id: block.doc_id,
            })
            .collect())
    }
}

/// Reciprocal rank fusion over several ranked lists, keyed by chunk id:
/// `score(d) = Σ 1/(c + rank_i(d))` with 1-based ranks and `c = 60`.
pub fn rrf_fuse(lists: &[Vec<ChunkSearchResult>], k: usize) -> Vec<ChunkSearchResult> {
    let mut scores: Vec<(String, f64)> = Vec::new();
    let mut by_id: Vec<(String, ChunkSearchResult)> = Vec::new();

    for list in lists {
        for (rank, result) in list.iter().take(k).enumerate() {
            let contribution = 1.0 / (RRF_C + rank as f64 + 1.0);
            let id = result.chunk.id.clone();
            if let Some(entry) = scores.iter_mut().find(|(key, _)| *key == id) {
                entry.1 += contribution;
            } else {
                scores.push((id.clone(), contribution));
                by_id.push((id, result.clone()));
            }
        }
    }

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    scores
        .into_iter()
        .take(k)
        .filter_map(|(id, score)| {
            by_id.iter().find(|(key, _)| *key == id).map(|(_, result)| {
                let mut fused = result.clone();
                fused.score = score as f32;
                fused
            })
        })
        .collect()
}

/// Attach cross-encoder scores, sort descending, apply the threshold, and
/// keep the best `top_n`.
pub fn apply_rerank(
    candidates: Vec<RetrievedDoc>,
    scores: &[f32],
    threshold: Option<f32>,
    top_n: usize,
) -> Vec<RetrievedDoc> {
    let mut scored: Vec<RetrievedDoc> = candidates
        .into_iter()
        .zip(scores.iter().copied())
        .map(|(mut candidate, score)| {
            candidate.rerank_score = Some(score);
            candidate
        })
        .collect();

    scored.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if let Some(threshold) = threshold {
        scored.retain(|candidate| candidate.rerank_score.unwrap_or(f32::MIN) >= threshold);
    }

    scored.truncate(top_n.max(1));
    scored
}

/// Render candidates as the tool message the grader and answerer consume.
pub fn format_documents(documents: &[RetrievedDoc]) -> String {
    let mut parts = Vec::with_capacity(documents.len());

    for (index, document) in documents.iter().enumerate() {
        let content = document.content.trim();
        if content.is_empty() {
            continue;
        }

        let mut header = format!("[Document {}]", index.saturating_add(1));
        let mut metadata_parts = Vec::new();
        if !document.source.is_empty() {
            metadata_parts.push(format!("Source: {}", document.source));
        }
        if let Some(title) = &document.title {
            metadata_parts.push(format!("Title: {title}"));
        }
        if let Some(score) = document.rerank_score {
            metadata_parts.push(format!("Rerank_score: {score:.4}"));
        }
        if !metadata_parts.is_empty() {
            let _ = write!(header, " ({})", metadata_parts.join(", "));
        }

        parts.push(format!("{header}\n{content}"));
    }

    parts.join("\n\n")
}

/// Whitespace terms for the FTS leg; CJK queries go through jieba.
fn segment_query(query: &str) -> String {
    let has_cjk = query
        .chars()
        .any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c) || ('\u{3400}'..='\u{4dbf}').contains(&c));

    if !has_cjk {
        return query.to_string();
    }

    static JIEBA: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    let jieba = JIEBA.get_or_init(jieba_rs::Jieba::new);
    jieba
        .cut(query, false)
        .into_iter()
        .filter(|term| !term.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::parent_block::ParentMetadata;
    use uuid::Uuid;

    const DIMENSION: usize = 32;

    fn chunk_result(id: &str, parent_id: &str, content: &str, score: f32) -> ChunkSearchResult {
        let mut chunk = ChildChunk::new(
            "d1".to_string(),
            parent_id.to_string(),
            "u1".to_string(),
            0,
            content.to_string(),
            "doc.pdf".to_string(),
            Vec::new(),
        );
        chunk.id = id.to_string();
        ChunkSearchResult { chunk, score }
    }

    fn doc(content: &str) -> RetrievedDoc {
        RetrievedDoc {
            content: content.to_string(),
            source: "doc.pdf".to_string(),
            title: None,
            rerank_score: None,
            parent_id: None,
            doc_id: "d1".to_string(),
        }
    }

    #[test]
    fn rrf_rewards_presence_in_both_lists() {
        let sparse = vec![
            chunk_result("shared", "p1", "both lists", 3.0),
            chunk_result("sparse_only", "p2", "bm25 hit", 2.0),
        ];
        let dense = vec![
            chunk_result("dense_only", "p3", "vector hit", 0.9),
            chunk_result("shared", "p1", "both lists", 0.8),
        ];

        let fused = rrf_fuse(&[sparse, dense], 10);
        assert_eq!(fused[0].chunk.id, "shared");
        assert_eq!(fused.len(), 3);
        // 1/(60+1) + 1/(60+2) for the shared chunk
        let expected = (1.0 / 61.0 + 1.0 / 62.0) as f32;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn rrf_truncates_to_k() {
        let list: Vec<ChunkSearchResult> = (0..30)
            .map(|i| chunk_result(&format!("c{i}"), "p", "body", 1.0))
            .collect();
        let fused = rrf_fuse(&[list], 5);
        assert_eq!(fused.len(), 5);
    }

    #[test]
    fn rerank_sorts_thresholds_and_truncates() {
        let candidates = vec![doc("low"), doc("high"), doc("mid")];
        let scores = [0.1, 0.9, 0.5];

        let reranked = apply_rerank(candidates, &scores, Some(0.3), 2);
        let contents: Vec<_> = reranked.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["high", "mid"]);
        assert_eq!(reranked[0].rerank_score, Some(0.9));
    }

    #[test]
    fn rerank_threshold_can_empty_the_set() {
        let reranked = apply_rerank(vec![doc("weak")], &[0.05], Some(0.5), 3);
        assert!(reranked.is_empty());
    }

    #[test]
    fn format_includes_metadata_header() {
        let mut first = doc("First content");
        first.title = Some("Handbook".to_string());
        first.rerank_score = Some(0.8123);
        let second = doc("Second content");

        let formatted = format_documents(&[first, second]);
        assert!(formatted.starts_with("[Document 1] (Source: doc.pdf, Title: Handbook, Rerank_score: 0.8123)\nFirst content"));
        assert!(formatted.contains("\n\n[Document 2] (Source: doc.pdf)\nSecond content"));
    }

    #[test]
    fn segment_query_passes_ascii_through_and_segments_cjk() {
        assert_eq!(segment_query("plain english query"), "plain english query");
        let segmented = segment_query("中华人民共和国的首都");
        assert!(segmented.contains(' '), "expected segmented terms: {segmented}");
    }

    async fn seeded_retriever(
        use_parent_child: bool,
    ) -> (Retriever, Arc<SurrealDbClient>, Arc<EmbeddingProvider>) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("retriever_test", &database)
                .await
                .expect("memory db"),
        );
        db.ensure_initialized(DIMENSION).await.expect("schema");

        let provider =
            Arc::new(EmbeddingProvider::new_hashed(DIMENSION).expect("hashed provider"));

        let parent = ParentBlock::new(
            "parent-1".to_string(),
            "d1".to_string(),
            "u1".to_string(),
            "Full parent context: the capital of France is Paris, a fact every atlas lists."
                .to_string(),
            ParentMetadata {
                source: "atlas.pdf".to_string(),
                title: Some("Atlas".to_string()),
            },
        );
        ParentBlock::replace_for_document("u1", "d1", vec![parent], &db)
            .await
            .expect("seed parent");

        let embedding = provider
            .embed("The capital of France is Paris.")
            .await
            .expect("embed");
        let chunk = ChildChunk::new(
            "d1".to_string(),
            "parent-1".to_string(),
            "u1".to_string(),
            0,
            "The capital of France is Paris.".to_string(),
            "atlas.pdf".to_string(),
            embedding,
        );
        ChildChunk::upsert_batch(vec![chunk], &db)
            .await
            .expect("seed chunk");
        db.rebuild_indexes().await.expect("rebuild");

        let config = RetrieverConfig {
            retrieval_k: 10,
            use_hybrid: true,
            use_parent_child,
            rerank_top_k: 10,
            rerank_top_n: 3,
            rerank_score_threshold: None,
            store_is_local: true,
        };

        (
            Retriever::new(Arc::clone(&db), Arc::clone(&provider), None, config),
            db,
            provider,
        )
    }

    #[tokio::test]
    async fn retrieve_projects_children_to_parents() {
        let (retriever, _db, _provider) = seeded_retriever(true).await;

        let (formatted, docs) = retriever
            .retrieve("u1", "What is the capital of France?")
            .await
            .expect("retrieve");

        assert!(!docs.is_empty());
        assert!(formatted.contains("[Document 1]"));
        assert!(formatted.contains("Full parent context"));
        assert!(formatted.contains("Source: atlas.pdf"));
        assert!(formatted.contains("Title: Atlas"));
    }

    #[tokio::test]
    async fn retrieve_without_parent_projection_returns_children() {
        let (retriever, _db, _provider) = seeded_retriever(false).await;

        let (formatted, docs) = retriever
            .retrieve("u1", "capital France Paris")
            .await
            .expect("retrieve");

        assert!(!docs.is_empty());
        assert!(formatted.contains("The capital of France is Paris."));
    }

    #[tokio::test]
    async fn retrieve_is_tenant_isolated() {
        let (retriever, _db, _provider) = seeded_retriever(true).await;

        let (formatted, docs) = retriever
            .retrieve("other_user", "capital of France secret-alpha")
            .await
            .expect("retrieve");

        assert!(docs.is_empty());
        assert_eq!(formatted, NO_RELEVANT_DOCUMENTS);
    }

    #[tokio::test]
    async fn empty_corpus_returns_sentinel() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("retriever_empty", &database)
                .await
                .expect("memory db"),
        );
        db.ensure_initialized(DIMENSION).await.expect("schema");
        let provider =
            Arc::new(EmbeddingProvider::new_hashed(DIMENSION).expect("hashed provider"));

        let retriever = Retriever::new(
            Arc::clone(&db),
            provider,
            None,
            RetrieverConfig {
                retrieval_k: 10,
                use_hybrid: true,
                use_parent_child: true,
                rerank_top_k: 10,
                rerank_top_n: 3,
                rerank_score_threshold: None,
                store_is_local: true,
            },
        );

        let (formatted, docs) = retriever
            .retrieve("u1", "Summarize the constitution")
            .await
            .expect("retrieve");
        assert_eq!(formatted, NO_RELEVANT_DOCUMENTS);
        assert!(docs.is_empty());
    }
}
