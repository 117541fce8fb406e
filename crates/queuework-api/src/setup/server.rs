//! Server startup and graceful shutdown

use super::{maintenance, App};
use crate::constants::SHUTDOWN_DRAIN_SECS;
use anyhow::Result;
use queuework_core::Config;
use std::time::Duration;
use tokio::sync::watch;

/// Start the server with graceful shutdown
pub async fn start_server(config: &Config, app: App) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.server_port());
    tracing::info!(addr = %addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let maintenance = maintenance::spawn_maintenance(app.state.clone(), stop_rx);

    tracing::info!(
        max_chunk_mb = config.upload_max_chunk_bytes() / 1024 / 1024,
        default_disk = %config.default_disk(),
        archive_disk = %config.archive_disk(),
        job_timeout_secs = config.archive_job_timeout_seconds(),
        "Server ready and accepting connections"
    );

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop claiming new tasks, then give running builds a bounded window.
    app.worker.shutdown().await;
    if !app
        .worker
        .drain(Duration::from_secs(SHUTDOWN_DRAIN_SECS))
        .await
    {
        tracing::warn!("Archive builds still running at shutdown; their jobs will be recovered");
    }

    let _ = stop_tx.send(true);
    for handle in maintenance {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }

    tracing::info!("Shutting down gracefully...");
}
