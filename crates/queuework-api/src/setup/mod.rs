//! Application setup and initialization
//!
//! Builds repositories, disks, services and routes from [`Config`] so `main`
//! only has to start the server.

pub mod database;
pub mod maintenance;
pub mod routes;
pub mod server;
pub mod services;
pub mod storage;

use crate::state::AppState;
use anyhow::{Context, Result};
use queuework_core::Config;
use queuework_worker::TaskQueue;
use std::sync::Arc;

/// Everything the server needs to run and to shut down cleanly.
pub struct App {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    /// Worker pool building archives; drained on shutdown.
    pub worker: TaskQueue,
}

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<App> {
    config.validate().context("Configuration validation failed")?;

    crate::telemetry::init_telemetry(config.log_format())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment(),
        metadata_backend = %config.metadata_backend(),
        "Configuration loaded and validated successfully"
    );

    let repos = database::setup_repositories(&config).await?;
    let disks = storage::setup_disks(&config).await?;

    let (state, worker) = services::initialize_services(&config, repos, disks);

    let router = routes::setup_routes(&config, state.clone())?;

    Ok(App {
        state,
        router,
        worker,
    })
}
