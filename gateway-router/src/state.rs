use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::AppConfig,
};

use crate::worker_client::{HttpWorkerClient, WorkerClient};

#[derive(Clone)]
pub struct GatewayState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub storage: StorageManager,
    pub worker: Arc<dyn WorkerClient>,
}

impl GatewayState {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        storage: StorageManager,
    ) -> Self {
        let worker = Arc::new(HttpWorkerClient::new(config.worker_base_url.clone()));
        Self::with_worker(db, config, storage, worker)
    }

    pub fn with_worker(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        storage: StorageManager,
        worker: Arc<dyn WorkerClient>,
    ) -> Self {
        Self {
            db,
            config,
            storage,
            worker,
        }
    }
}
