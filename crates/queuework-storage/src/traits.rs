//! Storage abstraction trait
//!
//! This module defines the Storage trait that all disks must implement.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Invalid range {start}-{end} for {key}")]
    InvalidRange { key: String, start: u64, end: u64 },

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StorageError> for queuework_core::AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => {
                queuework_core::AppError::NotFound(format!("Blob not found: {}", key))
            }
            StorageError::InvalidKey(msg) => queuework_core::AppError::InvalidInput(msg),
            other => queuework_core::AppError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Object metadata applied when a file is uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl UploadOptions {
    /// Options that make a browser save the object as `filename`.
    pub fn attachment(filename: &str, content_type: &str) -> Self {
        UploadOptions {
            content_type: Some(content_type.to_string()),
            content_disposition: Some(attachment_disposition(filename)),
        }
    }
}

/// `attachment; filename="..."; filename*=UTF-8''...`
pub fn attachment_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, NON_ALPHANUMERIC)
    )
}

/// Storage abstraction trait
///
/// Every disk (remote object store, local filesystem) implements this trait so
/// the upload manager and the archive builder never couple to a backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload data to a specific storage key. Returns the object URL.
    async fn upload_with_key(
        &self,
        storage_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Upload data only when nothing is stored under `storage_key` yet. Returns
    /// false, leaving the stored object untouched, when the key already exists.
    async fn upload_if_absent(
        &self,
        storage_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<bool>;

    /// Upload a local file without loading it into memory. Returns the bytes written.
    async fn upload_file(
        &self,
        storage_key: &str,
        source: &Path,
        options: &UploadOptions,
    ) -> StorageResult<u64>;

    /// Download a file by its storage key
    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>>;

    /// Read bytes `start..=end`. `end` is clamped to the last byte of the blob.
    async fn download_range(&self, storage_key: &str, start: u64, end: u64)
        -> StorageResult<Bytes>;

    /// Download a file as a stream (for large files)
    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream>;

    /// Delete a file by its storage key. Deleting a missing key succeeds.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    /// Generate a time-limited download URL.
    ///
    /// When `download_filename` is set the URL asks the client to save the
    /// object under that name.
    async fn get_presigned_url(
        &self,
        storage_key: &str,
        expires_in: Duration,
        download_filename: Option<&str>,
    ) -> StorageResult<String>;

    /// Check if a file exists
    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Get the size in bytes of an object, if it exists.
    async fn content_length(&self, storage_key: &str) -> StorageResult<u64>;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}

/// Rejects keys that could escape a disk root.
pub(crate) fn validate_key(storage_key: &str) -> StorageResult<()> {
    if storage_key.is_empty()
        || storage_key.starts_with('/')
        || storage_key.split('/').any(|segment| segment == "..")
        || storage_key.contains('\\')
    {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Validates an inclusive range request; `end` may exceed the blob length.
pub(crate) fn check_range(storage_key: &str, start: u64, end: u64) -> StorageResult<()> {
    if end < start {
        return Err(StorageError::InvalidRange {
            key: storage_key.to_string(),
            start,
            end,
        });
    }
    Ok(())
}
