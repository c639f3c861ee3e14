use std::sync::Arc;

use anyhow::Context;
use kemem::api::{self, app_state::AppState};
use kemem::config::loader::{ConfigLoader, config_exists};
use kemem::observability::init_tracing;
use kemem::services::MemoryService;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("KEMEM_CONFIG") {
        Ok(path) => ConfigLoader::load_from(path.into()),
        Err(_) => ConfigLoader::load(),
    }
    .context("failed to load configuration")?;
    ConfigLoader::validate(&config)?;

    let _guard = init_tracing(&config.logging);
    info!("Starting {}...", config.app_name);
    if !config_exists() {
        info!("kemem.toml not found, using defaults and KEMEM_* environment");
    }
    info!("Configuration loaded successfully");

    let service = MemoryService::from_config(&config)
        .await
        .context("failed to open memory stores")?;
    info!(
        "Memory service initialized (graph enabled: {})",
        service.graph_enabled()
    );

    let app_state = AppState::new(Arc::new(service), &config.app_name);
    let router = api::create_router(app_state, &config.server);
    info!("API router created");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
