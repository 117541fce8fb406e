//! Route configuration and setup

use crate::api_doc;
use crate::constants::{API_PREFIX, FILES_ROUTE, MULTIPART_OVERHEAD_BYTES};
use crate::handlers;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use queuework_core::Config;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router<()>, anyhow::Error> {
    let cors = setup_cors(config)?;

    // One chunk plus multipart framing; JSON bodies are far smaller.
    let body_limit = config.upload_max_chunk_bytes() as usize + MULTIPART_OVERHEAD_BYTES;

    let app = api_routes()
        .merge(public_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

fn api_routes() -> Router<Arc<AppState>> {
    let files = format!("{}{}", API_PREFIX, FILES_ROUTE);
    Router::new()
        .route(&files, get(handlers::documents::list_documents))
        .route(
            &format!("{}/chunked/init", files),
            post(handlers::uploads::init_upload),
        )
        .route(
            &format!("{}/chunked/upload", files),
            post(handlers::uploads::upload_chunk),
        )
        .route(
            &format!("{}/chunked/finalize", files),
            post(handlers::uploads::finalize_upload),
        )
        .route(
            &format!("{}/chunked/abort", files),
            post(handlers::uploads::abort_upload),
        )
        .route(
            &format!("{}/chunked/{{upload_id}}", files),
            get(handlers::uploads::get_upload_progress),
        )
        .route(
            &format!("{}/zip-jobs", files),
            post(handlers::archives::create_zip_job),
        )
        .route(
            &format!("{}/zip-jobs/{{job_id}}", files),
            get(handlers::archives::get_zip_job),
        )
        .route(
            &format!("{}/openapi.json", API_PREFIX),
            get(api_doc::openapi_json),
        )
}

/// Routes outside the API prefix
fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            &format!("{}/{{*key}}", FILES_ROUTE),
            get(handlers::files::download_signed),
        )
}

/// Setup CORS configuration
fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let cors = if config.cors_origins().iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow all origins - not recommended for production");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins = config
            .cors_origins()
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
    };
    Ok(cors)
}
