//! Archive job endpoints. Building happens on the worker pool; these only
//! queue a job and report on it.

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use queuework_core::models::{ArchiveJobStatus, ArchiveJobStatusResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateZipJobRequest {
    /// Documents to include, in entry order. Duplicates are dropped.
    pub document_ids: Vec<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateZipJobResponse {
    pub job_id: Uuid,
    pub status: ArchiveJobStatus,
    pub progress: i16,
}

#[utoipa::path(
    post,
    path = "/api/files/zip-jobs",
    tag = "archives",
    request_body = CreateZipJobRequest,
    responses(
        (status = 202, description = "Archive job queued", body = CreateZipJobResponse),
        (status = 400, description = "Empty selection or documents on different disks", body = ErrorResponse),
        (status = 404, description = "Unknown document ids", body = ErrorResponse)
    )
)]
pub async fn create_zip_job(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<CreateZipJobRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let job = state.archives.request_archive(request.document_ids).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateZipJobResponse {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/files/zip-jobs/{job_id}",
    tag = "archives",
    params(
        ("job_id" = Uuid, Path, description = "Archive job ID")
    ),
    responses(
        (status = 200, description = "Job state; completed jobs carry a download URL", body = ArchiveJobStatusResponse),
        (status = 404, description = "Job not found", body = ErrorResponse)
    )
)]
pub async fn get_zip_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let status = state.archives.get_job_status(job_id).await?;
    Ok(Json(status))
}
