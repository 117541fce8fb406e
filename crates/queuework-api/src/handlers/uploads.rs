//! Chunked upload endpoints: init, chunk, finalize, abort and progress.

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use queuework_core::models::{
    DocumentResponse, InitUploadRequest, InitUploadResponse, UploadChunkResponse,
    UploadProgressResponse,
};
use queuework_core::AppError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Body of the finalize and abort calls
#[derive(Debug, Deserialize, ToSchema)]
pub struct UploadSessionRequest {
    pub upload_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FinalizeUploadResponse {
    pub message: String,
    pub document: DocumentResponse,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/api/files/chunked/init",
    tag = "uploads",
    request_body = InitUploadRequest,
    responses(
        (status = 201, description = "Upload session opened", body = InitUploadResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<InitUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let response = state.uploads.init(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[utoipa::path(
    post,
    path = "/api/files/chunked/upload",
    tag = "uploads",
    request_body(
        content = inline(Object),
        content_type = "multipart/form-data",
        description = "Fields: upload_id, chunk_index, chunk (file)"
    ),
    responses(
        (status = 200, description = "Chunk stored, or already stored", body = UploadChunkResponse),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 404, description = "Session not found or expired", body = ErrorResponse),
        (status = 413, description = "Chunk too large", body = ErrorResponse)
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut multipart = multipart?;
    let mut upload_id: Option<Uuid> = None;
    let mut chunk_index: Option<u32> = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "upload_id" => {
                let text = field_text(field).await?;
                upload_id = Some(text.trim().parse().map_err(|_| {
                    AppError::InvalidInput("upload_id must be a UUID".to_string())
                })?);
            }
            "chunk_index" => {
                let text = field_text(field).await?;
                chunk_index = Some(text.trim().parse().map_err(|_| {
                    AppError::InvalidInput(
                        "chunk_index must be a non-negative integer".to_string(),
                    )
                })?);
            }
            "chunk" => {
                chunk = Some(field.bytes().await.map_err(|e| {
                    AppError::InvalidInput(format!("Failed to read chunk: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let upload_id = upload_id.ok_or_else(|| missing_field("upload_id"))?;
    let chunk_index = chunk_index.ok_or_else(|| missing_field("chunk_index"))?;
    let chunk = chunk.ok_or_else(|| missing_field("chunk"))?;

    let response = state
        .uploads
        .accept_chunk(upload_id, chunk_index, chunk)
        .await?;
    Ok(Json(response))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read multipart field: {}", e)))
}

fn missing_field(name: &str) -> AppError {
    AppError::InvalidInput(format!("Missing multipart field '{}'", name))
}

#[utoipa::path(
    post,
    path = "/api/files/chunked/finalize",
    tag = "uploads",
    request_body = UploadSessionRequest,
    responses(
        (status = 201, description = "File assembled and registered", body = FinalizeUploadResponse),
        (status = 400, description = "Upload incomplete", body = ErrorResponse),
        (status = 404, description = "Session or chunk not found", body = ErrorResponse)
    )
)]
pub async fn finalize_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<UploadSessionRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let document = state.uploads.finalize(request.upload_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(FinalizeUploadResponse {
            message: "File uploaded successfully.".to_string(),
            document: document.into(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/files/chunked/abort",
    tag = "uploads",
    request_body = UploadSessionRequest,
    responses(
        (status = 200, description = "Session and chunks discarded", body = MessageResponse),
        (status = 404, description = "Session not found or expired", body = ErrorResponse)
    )
)]
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<UploadSessionRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.uploads.abort(request.upload_id).await?;
    Ok(Json(MessageResponse {
        message: "Upload aborted successfully.".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/files/chunked/{upload_id}",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session ID")
    ),
    responses(
        (status = 200, description = "Session progress", body = UploadProgressResponse),
        (status = 404, description = "Session not found or expired", body = ErrorResponse)
    )
)]
pub async fn get_upload_progress(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let progress = state.uploads.get_upload_progress(upload_id).await?;
    Ok(Json(progress))
}
