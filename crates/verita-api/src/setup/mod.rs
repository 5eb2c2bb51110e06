//! Application setup and initialization

pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use std::sync::Arc;

use verita_core::Config;
use verita_db::MemoryStore;
use verita_processors::ProcessorCatalog;

use crate::state::AppState;
pub use services::{initialize_services, Stores};

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, axum::Router)> {
    // Fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    verita_infra::init_telemetry(config.is_production())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment,
        "Configuration loaded and validated successfully"
    );

    let stores = match &config.database_url {
        Some(url) => {
            let pool = verita_db::setup_database(url, config.db_max_connections).await?;
            Stores::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Stores::memory(MemoryStore::new())
        }
    };

    let catalog = match &config.processors_config {
        Some(path) => ProcessorCatalog::load(path)?,
        None => {
            tracing::warn!("PROCESSORS_CONFIG not set, no processors are registered");
            ProcessorCatalog::default()
        }
    };
    let registry = catalog
        .into_registry(config.webhook_base_url.as_deref(), |key| {
            std::env::var(key).ok()
        })
        .context("Failed to build processor registry")?;
    tracing::info!(processors = registry.len(), "Processor registry built");

    let state = initialize_services(config, stores, Arc::new(registry)).await?;
    let router = routes::setup_routes(state.clone());

    Ok((state, router))
}
