//! Download endpoint for blobs on the local disk.
//!
//! Remote disks hand out presigned URLs; the local disk signs its own links
//! and they are served here after the signature and expiry check.

use crate::error::HttpAppError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use futures::TryStreamExt;
use queuework_core::AppError;
use queuework_services::{detect_mime_type, Storage, StorageError};
use queuework_storage::{keys, traits::attachment_disposition};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub filename: Option<String>,
    pub signature: String,
}

pub async fn download_signed(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    let local = state
        .disks
        .local()
        .ok_or_else(|| AppError::NotFound("No local disk is configured".to_string()))?;

    local
        .verify_signed_url(&key, query.expires, query.filename.as_deref(), &query.signature)
        .map_err(|e| match e {
            StorageError::InvalidKey(msg) => AppError::Forbidden(msg),
            other => AppError::from(other),
        })?;

    let filename = query
        .filename
        .clone()
        .unwrap_or_else(|| keys::file_basename(&key).to_string());
    let length = local.content_length(&key).await?;
    let stream = local.download_stream(&key).await?;

    tracing::debug!(key = %key, bytes = length, "Serving signed local download");

    Ok((
        [
            (header::CONTENT_TYPE, detect_mime_type(&[], &filename)),
            (header::CONTENT_LENGTH, length.to_string()),
            (header::CONTENT_DISPOSITION, attachment_disposition(&filename)),
        ],
        Body::from_stream(stream.map_err(std::io::Error::other)),
    ))
}
