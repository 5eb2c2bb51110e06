//! Postgres repositories and pool setup

pub mod analysis;
pub mod jobs;
pub mod media;
pub mod throttle;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub use analysis::AnalysisResultRepository;
pub use jobs::{JobRecord, JobRepository, JOB_NOTIFY_CHANNEL};
pub use media::MediaRepository;
pub use throttle::ThrottleRepository;

/// Connect to Postgres and apply the embedded migrations.
pub async fn setup_database(database_url: &str, max_connections: u32) -> Result<PgPool> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(max_connections, "Database connected successfully");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}
