//! Single-process deployment: gateway and worker side by side, sharing one
//! database connection pool and blob store.

use std::sync::Arc;

use axum::Router;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use gateway_router::{gateway_routes, state::GatewayState};
use ingestion_pipeline::{IngestionConfig, IngestionPipeline};
use retrieval_graph::{
    reranking::RerankBackend, CheckpointStore, GraphConfig, LlmSettings, OpenAiChatModel,
    RetrievalGraph, Retriever, RetrieverConfig,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use worker_router::{state::WorkerState, worker_routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedding_provider =
        Arc::new(EmbeddingProvider::from_config(&config, Some(Arc::clone(&openai_client))).await?);
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_dimension = embedding_provider.dimension(),
        "Embedding provider initialized"
    );

    db.ensure_initialized(embedding_provider.dimension()).await?;

    let storage = StorageManager::new(&config).await?;

    // Worker side
    let reranker = RerankBackend::maybe_from_config(&config)?;
    let retriever = Arc::new(Retriever::new(
        Arc::clone(&db),
        Arc::clone(&embedding_provider),
        reranker,
        RetrieverConfig::from_app_config(&config),
    ));
    let model = Arc::new(OpenAiChatModel::new(
        Arc::clone(&openai_client),
        LlmSettings {
            model: config.llm_model.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        },
    ));
    let checkpoint = CheckpointStore::from_config(&config, Arc::clone(&db)).map(Arc::new);
    let graph = Arc::new(RetrievalGraph::new(
        model,
        retriever,
        checkpoint,
        GraphConfig::from_app_config(&config),
    ));
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        storage.clone(),
        Arc::clone(&embedding_provider),
        IngestionConfig::from_app_config(&config),
    ));
    let worker_state = WorkerState::new(
        Arc::clone(&db),
        config.clone(),
        graph,
        pipeline,
        embedding_provider,
    );
    let worker_app = Router::new()
        .merge(worker_routes(&worker_state))
        .layer(TraceLayer::new_for_http())
        .with_state(worker_state);

    // Gateway side
    let gateway_state = GatewayState::new(db, config.clone(), storage);
    let gateway_app = Router::new()
        .nest("/api", gateway_routes(&gateway_state))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway_state);

    let gateway_address = format!("0.0.0.0:{}", config.gateway_port);
    let worker_address = format!("0.0.0.0:{}", config.worker_port);
    info!("Starting gateway on {gateway_address} and worker on {worker_address}");

    let gateway_listener = tokio::net::TcpListener::bind(gateway_address).await?;
    let worker_listener = tokio::net::TcpListener::bind(worker_address).await?;

    tokio::try_join!(
        async { axum::serve(gateway_listener, gateway_app).await },
        async { axum::serve(worker_listener, worker_app).await },
    )?;

    Ok(())
}
