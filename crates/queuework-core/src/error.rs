//! Error types module
//!
//! All errors surfaced by the upload manager, the archive lifecycle and the
//! repositories are unified under `AppError`. Each variant self-describes its
//! HTTP status, machine code and retry behaviour through [`ErrorMetadata`].
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;
use uuid::Uuid;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "DATABASE_ERROR")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in production
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Archive job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Documents not found: {0:?}")]
    DocumentsNotFound(Vec<i64>),

    #[error("Chunk index {index} is out of range for {total_chunks} chunks")]
    InvalidChunkIndex { index: u32, total_chunks: u32 },

    #[error("Documents must share a single remote disk: {0}")]
    MixedDisks(String),

    #[error("Upload incomplete: {uploaded} of {total_chunks} chunks received")]
    IncompleteUpload { uploaded: u32, total_chunks: u32 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Chunk {index} not found.")]
    MissingChunk { index: u32 },

    #[error("Archive build failed: {0}")]
    ArchiveBuild(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, suggested_action, sensitive, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (
    u16,
    &'static str,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match err {
        AppError::Database(_) => (
            500,
            "DATABASE_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Storage(_) => (
            503,
            "STORAGE_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            422,
            "INVALID_INPUT",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::NotFound(_) => (
            404,
            "NOT_FOUND",
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::SessionNotFound(_) => (
            404,
            "UPLOAD_SESSION_NOT_FOUND",
            false,
            Some("Start a new upload session"),
            false,
            LogLevel::Debug,
        ),
        AppError::JobNotFound(_) => (
            404,
            "ARCHIVE_JOB_NOT_FOUND",
            false,
            Some("Verify the job ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::DocumentsNotFound(_) => (
            404,
            "DOCUMENTS_NOT_FOUND",
            false,
            Some("Verify the document IDs exist"),
            false,
            LogLevel::Debug,
        ),
        AppError::InvalidChunkIndex { .. } => (
            422,
            "INVALID_CHUNK_INDEX",
            false,
            Some("Send an index between 0 and total_chunks - 1"),
            false,
            LogLevel::Debug,
        ),
        AppError::MixedDisks(_) => (
            422,
            "MIXED_DISKS",
            false,
            Some("Request archives for documents stored on a single remote disk"),
            false,
            LogLevel::Debug,
        ),
        AppError::IncompleteUpload { .. } => (
            409,
            "INCOMPLETE_UPLOAD",
            false,
            Some("Upload the missing chunks before finalizing"),
            false,
            LogLevel::Debug,
        ),
        AppError::Conflict(_) => (
            409,
            "CONFLICT",
            false,
            None,
            false,
            LogLevel::Debug,
        ),
        AppError::MissingChunk { .. } => (
            500,
            "MISSING_CHUNK",
            false,
            Some("Abort the upload and start again"),
            false,
            LogLevel::Error,
        ),
        AppError::ArchiveBuild(_) => (
            500,
            "ARCHIVE_BUILD_FAILED",
            false,
            Some("Request a new archive"),
            false,
            LogLevel::Error,
        ),
        AppError::Forbidden(_) => (
            403,
            "FORBIDDEN",
            false,
            Some("Request a fresh download link"),
            false,
            LogLevel::Debug,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            500,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Storage(_) => "Storage",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
            AppError::SessionNotFound(_) => "SessionNotFound",
            AppError::JobNotFound(_) => "JobNotFound",
            AppError::DocumentsNotFound(_) => "DocumentsNotFound",
            AppError::InvalidChunkIndex { .. } => "InvalidChunkIndex",
            AppError::MixedDisks(_) => "MixedDisks",
            AppError::IncompleteUpload { .. } => "IncompleteUpload",
            AppError::Conflict(_) => "Conflict",
            AppError::MissingChunk { .. } => "MissingChunk",
            AppError::ArchiveBuild(_) => "ArchiveBuild",
            AppError::Forbidden(_) => "Forbidden",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).4
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).5
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Storage(_) => "Failed to access storage".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::SessionNotFound(_) => "Upload session not found or expired.".to_string(),
            AppError::JobNotFound(_) => "Archive job not found.".to_string(),
            AppError::DocumentsNotFound(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                format!("Documents not found: {}", ids.join(", "))
            }
            AppError::InvalidChunkIndex { .. } => "Invalid chunk index.".to_string(),
            AppError::MixedDisks(ref msg) => msg.clone(),
            AppError::IncompleteUpload {
                uploaded,
                total_chunks,
            } => format!(
                "Upload incomplete: {} of {} chunks received.",
                uploaded, total_chunks
            ),
            AppError::Conflict(ref msg) => msg.clone(),
            AppError::MissingChunk { index } => format!("Chunk {} not found.", index),
            AppError::ArchiveBuild(ref msg) => msg.clone(),
            AppError::Forbidden(ref msg) => msg.clone(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }
}
