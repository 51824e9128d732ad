use std::sync::Arc;

use axum::Router;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::get_config, embedding::configured_dimension},
};
use gateway_router::{gateway_routes, state::GatewayState};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

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

    db.ensure_initialized(configured_dimension(&config)?).await?;

    let storage = StorageManager::new(&config).await?;
    let state = GatewayState::new(db, config.clone(), storage);

    let app = Router::new()
        .nest("/api", gateway_routes(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let serve_address = format!("0.0.0.0:{}", config.gateway_port);
    info!("Starting gateway listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
