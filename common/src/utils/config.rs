use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Fastembed,
    Openai,
    Remote,
    Hashed,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Memory,
    Database,
}

/// Whether the vector corpus is locally enumerable. BM25 hybrid retrieval
/// only works against a local store.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreMode {
    Local,
    Cloud,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_vector_store_mode")]
    pub vector_db_mode: VectorStoreMode,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    #[serde(default = "default_worker_base_url")]
    pub worker_base_url: String,

    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_base_url: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_true")]
    pub use_hybrid_retriever: bool,
    #[serde(default = "default_true")]
    pub use_parent_child_strategy: bool,
    #[serde(default)]
    pub use_reranker: bool,
    #[serde(default)]
    pub use_remote_reranker: bool,
    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,
    #[serde(default)]
    pub reranker_base_url: Option<String>,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default)]
    pub rerank_score_threshold: Option<f32>,
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,

    #[serde(default = "default_parent_chunk_size")]
    pub parent_chunk_size: usize,
    #[serde(default = "default_child_chunk_size")]
    pub child_chunk_size: usize,

    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_true")]
    pub use_message_summarization: bool,
    #[serde(default = "default_summarization_threshold")]
    pub message_summarization_threshold: usize,
    #[serde(default = "default_summarization_keep")]
    pub message_summarization_keep_messages: usize,
    #[serde(default = "default_summarization_max_tokens")]
    pub message_summarization_max_tokens: u32,
    #[serde(default)]
    pub use_checkpoint: bool,
    #[serde(default = "default_checkpoint_kind")]
    pub checkpoint_type: CheckpointKind,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_vector_store_mode() -> VectorStoreMode {
    VectorStoreMode::Local
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_worker_port() -> u16 {
    8001
}

fn default_worker_base_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_temperature() -> f32 {
    0.7
}

fn default_llm_max_tokens() -> u32 {
    2_048
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Fastembed
}

fn default_embedding_model() -> String {
    "BAAI/bge-small-zh-v1.5".to_string()
}

fn default_embedding_dimensions() -> usize {
    512
}

fn default_reranker_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}

fn default_rerank_top_k() -> usize {
    10
}

fn default_rerank_top_n() -> usize {
    3
}

fn default_retrieval_k() -> usize {
    20
}

fn default_parent_chunk_size() -> usize {
    1_800
}

fn default_child_chunk_size() -> usize {
    450
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_summarization_threshold() -> usize {
    8_000
}

fn default_summarization_keep() -> usize {
    20
}

fn default_summarization_max_tokens() -> u32 {
    500
}

fn default_checkpoint_kind() -> CheckpointKind {
    CheckpointKind::Memory
}

fn default_max_file_size() -> u64 {
    30 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "rag".to_string(),
            surrealdb_database: "rag".to_string(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            vector_db_mode: default_vector_store_mode(),
            gateway_port: default_gateway_port(),
            worker_port: default_worker_port(),
            worker_base_url: default_worker_base_url(),
            openai_api_key: String::new(),
            openai_base_url: default_openai_base_url(),
            llm_model: default_llm_model(),
            llm_temperature: default_llm_temperature(),
            llm_max_tokens: default_llm_max_tokens(),
            embedding_backend: default_embedding_backend(),
            embedding_model: default_embedding_model(),
            embedding_base_url: None,
            embedding_dimensions: default_embedding_dimensions(),
            use_hybrid_retriever: true,
            use_parent_child_strategy: true,
            use_reranker: false,
            use_remote_reranker: false,
            reranker_model: default_reranker_model(),
            reranker_base_url: None,
            rerank_top_k: default_rerank_top_k(),
            rerank_top_n: default_rerank_top_n(),
            rerank_score_threshold: None,
            retrieval_k: default_retrieval_k(),
            parent_chunk_size: default_parent_chunk_size(),
            child_chunk_size: default_child_chunk_size(),
            max_retry_count: default_max_retry_count(),
            use_message_summarization: true,
            message_summarization_threshold: default_summarization_threshold(),
            message_summarization_keep_messages: default_summarization_keep(),
            message_summarization_max_tokens: default_summarization_max_tokens(),
            use_checkpoint: false,
            checkpoint_type: default_checkpoint_kind(),
            max_file_size: default_max_file_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_spec_knobs() {
        let config = AppConfig::default();

        assert_eq!(config.parent_chunk_size, 1_800);
        assert_eq!(config.child_chunk_size, 450);
        assert_eq!(config.max_retry_count, 3);
        assert_eq!(config.message_summarization_threshold, 8_000);
        assert_eq!(config.message_summarization_keep_messages, 20);
        assert_eq!(config.rerank_top_n, 3);
        assert_eq!(config.max_file_size, 30 * 1024 * 1024);
        assert!(config.use_hybrid_retriever);
        assert!(config.use_parent_child_strategy);
    }
}
