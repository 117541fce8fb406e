//! OpenAPI documentation, served at `/api/openapi.json`.

use axum::Json;
use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use queuework_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Queuework API",
        version = "0.1.0",
        description = "Chunked uploads and queued ZIP archive builds"
    ),
    paths(
        handlers::documents::list_documents,
        handlers::uploads::init_upload,
        handlers::uploads::upload_chunk,
        handlers::uploads::finalize_upload,
        handlers::uploads::abort_upload,
        handlers::uploads::get_upload_progress,
        handlers::archives::create_zip_job,
        handlers::archives::get_zip_job,
        handlers::health::health_check,
    ),
    components(schemas(
        error::ErrorResponse,
        models::InitUploadRequest,
        models::InitUploadResponse,
        models::UploadChunkResponse,
        models::UploadProgressResponse,
        models::DocumentResponse,
        models::DocumentListResponse,
        models::ArchiveJobStatus,
        models::ArchiveJobStatusResponse,
        handlers::uploads::UploadSessionRequest,
        handlers::uploads::FinalizeUploadResponse,
        handlers::uploads::MessageResponse,
        handlers::archives::CreateZipJobRequest,
        handlers::archives::CreateZipJobResponse,
        handlers::health::HealthCheckResponse,
    )),
    tags(
        (name = "uploads", description = "Chunked two-phase uploads"),
        (name = "documents", description = "Finalized documents"),
        (name = "archives", description = "Queued ZIP archive jobs"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
