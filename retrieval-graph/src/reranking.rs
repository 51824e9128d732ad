//! Cross-encoder reranking.
//!
//! Local engines are expensive to load and not shareable across threads,
//! so a fixed pool sits behind a semaphore: checkout gives backpressure, a
//! round-robin counter spreads load. The remote backend is a thin HTTP
//! client for deployments that host the cross-encoder as a service.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    /// Build the pool at startup. `pool_size` bounds concurrent reranks.
    pub fn new(pool_size: usize, cache_dir: &Path) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranker pool size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(cache_dir)?;
        let mut init_options = RerankInitOptions::default();
        init_options.cache_dir = cache_dir.to_path_buf();
        init_options.show_download_progress = false;

        let mut engines = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            debug!("Creating reranking engine: {index}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Pool sized from config when the local reranker is enabled.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.use_reranker || config.use_remote_reranker {
            return Ok(None);
        }

        let cache_dir: PathBuf = Path::new(&config.data_dir).join("fastembed").join("reranker");
        Self::new(default_pool_size(), &cache_dir).map(Some)
    }

    /// Check out capacity and pick an engine; the returned lease releases
    /// the permit on drop.
    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool semaphore closed".into()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = Arc::clone(
            self.engines
                .get(idx)
                .ok_or_else(|| AppError::InternalError("reranker pool index out of range".into()))?,
        );

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Active lease on a single cross-encoder instance.
pub struct RerankerLease {
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    /// Score documents against the query; scores come back in input order.
    pub async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let count = documents.len();
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        let mut scores = vec![0.0_f32; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

/// HTTP cross-encoder: `POST {base}/rerank {query, documents} -> {scores}`.
pub struct RemoteReranker {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RemoteRerankResponse {
    scores: Vec<f32>,
}

impl RemoteReranker {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError> {
        let url = format!("{}/rerank", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "query": query, "documents": documents }))
            .send()
            .await?
            .error_for_status()?;

        let body: RemoteRerankResponse = response.json().await?;
        if body.scores.len() != documents.len() {
            return Err(AppError::InternalError(format!(
                "remote reranker returned {} scores for {} documents",
                body.scores.len(),
                documents.len()
            )));
        }
        Ok(body.scores)
    }
}

/// The retriever is agnostic to where the cross-encoder runs.
pub enum RerankBackend {
    Local(Arc<RerankerPool>),
    Remote(RemoteReranker),
}

impl RerankBackend {
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Self>, AppError> {
        if !config.use_reranker {
            return Ok(None);
        }

        if config.use_remote_reranker {
            let base_url = config.reranker_base_url.clone().ok_or_else(|| {
                AppError::Validation("remote reranker requires reranker_base_url".into())
            })?;
            return Ok(Some(Self::Remote(RemoteReranker::new(base_url))));
        }

        Ok(RerankerPool::maybe_from_config(config)?.map(Self::Local))
    }

    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError> {
        match self {
            Self::Local(pool) => {
                let lease = pool.checkout().await?;
                lease.rerank(query, documents.to_vec()).await
            }
            Self::Remote(remote) => remote.rerank(query, documents).await,
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Local(pool) => !pool.engines.is_empty(),
            Self::Remote(_) => true,
        }
    }
}
