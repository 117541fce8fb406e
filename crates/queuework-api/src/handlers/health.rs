//! Health check handler and response type.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an async check with timeout; returns "healthy", "timeout", or "{prefix}: {error}".
async fn run_check<F, T, E>(f: F, error_prefix: &str) -> String
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(CHECK_TIMEOUT, f).await {
        Ok(Ok(_)) => "healthy".to_string(),
        Ok(Err(e)) => format!("{}: {}", error_prefix, e),
        Err(_) => "timeout".to_string(),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthCheckResponse {
    pub status: String,
    pub database: String,
    pub storage: String,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service healthy", body = HealthCheckResponse),
        (status = 503, description = "A dependency is unavailable", body = HealthCheckResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = run_check(state.repos.documents.count(), "unhealthy").await;

    let storage = match state.disks.get(state.config.default_disk()) {
        Ok(disk) => run_check(disk.exists("health-check"), "unhealthy").await,
        Err(e) => format!("unhealthy: {}", e),
    };

    let healthy = database == "healthy" && storage == "healthy";
    if !healthy {
        tracing::warn!(database = %database, storage = %storage, "Health check failed");
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthCheckResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            storage,
        }),
    )
}
