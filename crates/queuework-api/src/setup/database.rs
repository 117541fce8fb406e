//! Metadata store setup

use anyhow::{Context, Result};
use queuework_core::config::MetadataBackend;
use queuework_core::Config;
use queuework_db::Repositories;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Repositories for the configured metadata backend.
pub async fn setup_repositories(config: &Config) -> Result<Repositories> {
    match config.metadata_backend() {
        MetadataBackend::Postgres => {
            let pool = setup_database(config).await?;
            Ok(Repositories::postgres(pool))
        }
        MetadataBackend::Memory => {
            tracing::warn!("Using in-memory metadata; sessions, documents and jobs are lost on restart");
            Ok(Repositories::in_memory())
        }
    }
}

/// Setup database connection pool and run migrations
pub async fn setup_database(config: &Config) -> Result<PgPool> {
    let url = config
        .database_url()
        .context("DATABASE_URL must be set when METADATA_BACKEND=postgres")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds()))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections(),
        "Database connected successfully"
    );

    queuework_db::MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}
