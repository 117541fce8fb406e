use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use queuework_core::models::DocumentListResponse;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Page size, 1..=100, default 25
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/files",
    tag = "documents",
    params(ListQuery),
    responses(
        (status = 200, description = "Documents, newest first", body = DocumentListResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    let page = state
        .archives
        .list_documents(query.limit, query.offset)
        .await?;
    Ok(Json(page))
}
