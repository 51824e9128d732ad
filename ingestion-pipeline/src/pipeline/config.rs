use common::utils::config::AppConfig;

/// Tunables that rarely change per deployment.
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub embed_retry_base_ms: u64,
    pub embed_retry_attempts: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            embed_retry_base_ms: 100,
            embed_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub parent_chunk_size: usize,
    pub child_chunk_size: usize,
    /// Children per embedding call.
    pub embed_batch_size: usize,
    pub tuning: IngestionTuning,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            parent_chunk_size: 1_800,
            child_chunk_size: 450,
            embed_batch_size: 50,
            tuning: IngestionTuning::default(),
        }
    }
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            parent_chunk_size: config.parent_chunk_size,
            child_chunk_size: config.child_chunk_size,
            ..Self::default()
        }
    }
}
