use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_openai::types::CreateEmbeddingRequestArgs;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Process-wide embedding service. One instance is created at startup and
/// shared behind an `Arc`; local models load lazily inside `from_config`.
pub enum EmbeddingProvider {
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        dimension: usize,
    },
    OpenAi {
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimension: usize,
    },
    Remote {
        client: reqwest::Client,
        base_url: String,
        dimension: usize,
    },
    /// Deterministic bag-of-words hashing; test backend only.
    Hashed { dimension: usize },
}

#[derive(Deserialize)]
struct RemoteEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl EmbeddingProvider {
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<async_openai::Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        match config.embedding_backend {
            EmbeddingBackend::Fastembed => {
                let model_name = resolve_fastembed_model(&config.embedding_model)?;
                let dimension = fastembed_dimension(&model_name)?;
                let cache_dir = Path::new(&config.data_dir).join("fastembed").join("embedding");
                std::fs::create_dir_all(&cache_dir)?;

                info!(model = %config.embedding_model, dimension, "Loading local embedding model");
                let options = InitOptions::new(model_name).with_cache_dir(cache_dir);
                let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await?
                    .map_err(|e| AppError::InternalError(e.to_string()))?;

                Ok(Self::FastEmbed {
                    model: Arc::new(Mutex::new(model)),
                    dimension,
                })
            }
            EmbeddingBackend::Openai => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Validation(
                        "OpenAI embedding backend requires an OpenAI client".into(),
                    )
                })?;
                Ok(Self::OpenAi {
                    client,
                    model: config.embedding_model.clone(),
                    dimension: config.embedding_dimensions,
                })
            }
            EmbeddingBackend::Remote => {
                let base_url = config.embedding_base_url.clone().ok_or_else(|| {
                    AppError::Validation(
                        "Remote embedding backend requires embedding_base_url".into(),
                    )
                })?;
                Ok(Self::Remote {
                    client: reqwest::Client::new(),
                    base_url,
                    dimension: config.embedding_dimensions,
                })
            }
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions),
        }
    }

    /// Deterministic embedding backend for tests; no model downloads.
    pub fn new_hashed(dimension: usize) -> Result<Self, AppError> {
        if dimension == 0 {
            return Err(AppError::Validation(
                "embedding dimension must be greater than zero".into(),
            ));
        }
        Ok(Self::Hashed { dimension })
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::FastEmbed { dimension, .. }
            | Self::OpenAi { dimension, .. }
            | Self::Remote { dimension, .. }
            | Self::Hashed { dimension } => *dimension,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self {
            Self::FastEmbed { .. } => "fastembed",
            Self::OpenAi { .. } => "openai",
            Self::Remote { .. } => "remote",
            Self::Hashed { .. } => "hashed",
        }
    }

    /// Health-check hook; local models are loaded eagerly in `from_config`
    /// so readiness reduces to "constructed".
    pub fn is_ready(&self) -> bool {
        true
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut batch = self.embed_batch(&[input.to_owned()]).await?;
        batch
            .pop()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    /// Embed a batch of texts in one backend call.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Self::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                let embeddings = guard
                    .embed(inputs.to_vec(), None)
                    .map_err(|e| AppError::InternalError(e.to_string()))?;
                Ok(embeddings)
            }
            Self::OpenAi {
                client,
                model,
                dimension,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .dimensions(u32::try_from(*dimension).unwrap_or(u32::MAX))
                    .input(inputs.to_vec())
                    .build()?;

                let response = client.embeddings().create(request).await?;
                debug!(count = response.data.len(), "Embeddings received from OpenAI");

                if response.data.len() != inputs.len() {
                    return Err(AppError::LLMParsing(format!(
                        "Expected {} embeddings, received {}",
                        inputs.len(),
                        response.data.len()
                    )));
                }

                Ok(response.data.into_iter().map(|d| d.embedding).collect())
            }
            Self::Remote {
                client,
                base_url,
                dimension,
            } => {
                let url = format!("{}/embed", base_url.trim_end_matches('/'));
                let response = client
                    .post(&url)
                    .json(&serde_json::json!({ "texts": inputs }))
                    .send()
                    .await?
                    .error_for_status()?;

                let body: RemoteEmbedResponse = response.json().await?;
                if body.embeddings.len() != inputs.len() {
                    return Err(AppError::LLMParsing(format!(
                        "Remote embedder returned {} vectors for {} texts",
                        body.embeddings.len(),
                        inputs.len()
                    )));
                }
                if let Some(first) = body.embeddings.first() {
                    if first.len() != *dimension {
                        return Err(AppError::LLMParsing(format!(
                            "Remote embedder dimension {} does not match configured {}",
                            first.len(),
                            dimension
                        )));
                    }
                }

                Ok(body.embeddings)
            }
            Self::Hashed { dimension } => Ok(inputs
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
        }
    }
}

/// Bag-of-words feature hashing with l2 normalization. Texts sharing words
/// land on shared components, which is enough signal for retrieval tests.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dimension];

    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let mut index_bytes = [0_u8; 8];
        index_bytes.copy_from_slice(&digest[..8]);
        let index = usize::try_from(u64::from_le_bytes(index_bytes) % dimension as u64)
            .unwrap_or_default();
        if let Some(slot) = vector.get_mut(index) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn resolve_fastembed_model(model_code: &str) -> Result<EmbeddingModel, AppError> {
    TextEmbedding::list_supported_models()
        .into_iter()
        .find(|info| info.model_code.eq_ignore_ascii_case(model_code))
        .map(|info| info.model)
        .ok_or_else(|| {
            AppError::Validation(format!(
                "Unknown fastembed embedding model '{model_code}'"
            ))
        })
}

fn fastembed_dimension(model: &EmbeddingModel) -> Result<usize, AppError> {
    TextEmbedding::list_supported_models()
        .into_iter()
        .find(|info| &info.model == model)
        .map(|info| info.dim)
        .ok_or_else(|| AppError::InternalError("Model dimension not listed".into()))
}

/// Expose the cache directory layout for operational tooling.
pub fn embedding_cache_dir(config: &AppConfig) -> PathBuf {
    Path::new(&config.data_dir).join("fastembed").join("embedding")
}

/// Dimension the configured backend will produce, without loading any
/// model. The gateway uses this to size the vector index it shares with
/// the worker.
pub fn configured_dimension(config: &AppConfig) -> Result<usize, AppError> {
    match config.embedding_backend {
        EmbeddingBackend::Fastembed => {
            let model = resolve_fastembed_model(&config.embedding_model)?;
            fastembed_dimension(&model)
        }
        EmbeddingBackend::Openai | EmbeddingBackend::Remote | EmbeddingBackend::Hashed => {
            Ok(config.embedding_dimensions)
        }
    }
}
