//! Per-thread conversation persistence.

use std::collections::HashMap;
use std::sync::Arc;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::checkpoint::Checkpoint},
    utils::config::{AppConfig, CheckpointKind},
};
use tokio::sync::RwLock;

use crate::messages::ChatTurn;

/// Checkpoint backing store. Memory dies with the process; the database
/// variant survives restarts. Writes are full-record, last writer wins.
pub enum CheckpointStore {
    Memory(RwLock<HashMap<String, Vec<ChatTurn>>>),
    Database(Arc<SurrealDbClient>),
}

impl CheckpointStore {
    pub fn memory() -> Self {
        Self::Memory(RwLock::new(HashMap::new()))
    }

    pub fn from_config(config: &AppConfig, db: Arc<SurrealDbClient>) -> Option<Self> {
        if !config.use_checkpoint {
            return None;
        }
        Some(match config.checkpoint_type {
            CheckpointKind::Memory => Self::memory(),
            CheckpointKind::Database => Self::Database(db),
        })
    }

    pub async fn load(&self, thread_id: &str) -> Result<Option<Vec<ChatTurn>>, AppError> {
        match self {
            Self::Memory(map) => Ok(map.read().await.get(thread_id).cloned()),
            Self::Database(db) => {
                let Some(checkpoint) = Checkpoint::get_for_thread(thread_id, db).await? else {
                    return Ok(None);
                };
                let messages = checkpoint
                    .payload
                    .get("messages")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let turns: Vec<ChatTurn> = serde_json::from_value(messages)
                    .map_err(|e| AppError::InternalError(format!("corrupt checkpoint: {e}")))?;
                Ok(Some(turns))
            }
        }
    }

    pub async fn save(
        &self,
        thread_id: &str,
        user_id: &str,
        messages: &[ChatTurn],
    ) -> Result<(), AppError> {
        match self {
            Self::Memory(map) => {
                map.write()
                    .await
                    .insert(thread_id.to_string(), messages.to_vec());
                Ok(())
            }
            Self::Database(db) => {
                let payload = serde_json::json!({
                    "messages": serde_json::to_value(messages)
                        .map_err(|e| AppError::InternalError(e.to_string()))?
                });
                Checkpoint::upsert_for_thread(thread_id, user_id, payload, db).await
            }
        }
    }
}
