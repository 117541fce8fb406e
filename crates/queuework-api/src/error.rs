//! HTTP error response conversion
//!
//! Handlers return `Result<impl IntoResponse, HttpAppError>`. Anything that
//! converts into `AppError` converts into `HttpAppError`, so `?` renders every
//! failure with the same status, body and log line.

use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection},
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use queuework_core::{AppError, ErrorMetadata, LogLevel};
use queuework_storage::StorageError;
use serde::{de::DeserializeOwned, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Machine-readable error code for programmatic handling
    pub code: String,
    /// Whether retrying the same request can succeed
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// Wrapper so `IntoResponse` can be implemented for the core error type.
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::from(err))
    }
}

impl From<StorageError> for HttpAppError {
    fn from(err: StorageError) -> Self {
        HttpAppError(AppError::from(err))
    }
}

impl From<JsonRejection> for HttpAppError {
    fn from(rejection: JsonRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl From<MultipartRejection> for HttpAppError {
    fn from(rejection: MultipartRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid multipart body: {}",
            rejection.body_text()
        )))
    }
}

/// JSON body extractor that answers malformed bodies with an [`ErrorResponse`].
#[derive(Debug, Clone, Copy)]
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = HttpAppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(inner) = Json::<T>::from_request(req, state)
            .await
            .map_err(HttpAppError::from)?;
        Ok(ValidatedJson(inner))
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Error occurred");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Error occurred");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Error occurred");
        }
    }
}

fn is_production_env() -> bool {
    std::env::var("ENVIRONMENT")
        .or_else(|_| std::env::var("APP_ENV"))
        .map(|env| env.to_lowercase() == "production" || env.to_lowercase() == "prod")
        .unwrap_or(false)
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let app_error = &self.0;

        let status = StatusCode::from_u16(app_error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(app_error);

        // Details never leave the process in production or for sensitive errors.
        let hide_details = is_production_env() || app_error.is_sensitive();
        let body = ErrorResponse {
            error: app_error.client_message(),
            details: (!hide_details).then(|| app_error.detailed_message()),
            error_type: (!hide_details).then(|| app_error.error_type().to_string()),
            code: app_error.error_code().to_string(),
            recoverable: app_error.is_recoverable(),
            suggested_action: app_error.suggested_action().map(String::from),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn storage_not_found_maps_to_not_found() {
        let HttpAppError(err) = StorageError::NotFound("k".to_string()).into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn storage_invalid_key_maps_to_invalid_input() {
        let HttpAppError(err) = StorageError::InvalidKey("bad".to_string()).into();
        match err {
            AppError::InvalidInput(msg) => assert_eq!(msg, "bad"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_not_found_renders_404() {
        let response = HttpAppError(AppError::SessionNotFound(Uuid::new_v4())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Upload session not found or expired.");
        assert_eq!(json["code"], "UPLOAD_SESSION_NOT_FOUND");
        assert_eq!(json["recoverable"], false);
        assert_eq!(json["suggested_action"], "Start a new upload session");
    }

    #[tokio::test]
    async fn sensitive_errors_hide_details() {
        let response = HttpAppError(AppError::Storage("bucket secret".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Failed to access storage");
        assert!(json.get("details").is_none());
        assert_eq!(json["recoverable"], true);
    }
}
