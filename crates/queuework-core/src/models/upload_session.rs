use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::StorageBackend;

/// Hard ceiling on chunks per session, mirrored in the validator below.
pub const MAX_CHUNK_COUNT: u32 = 10_000;

/// Ephemeral state of a chunked upload. Lives until finalize, abort or expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub folder: String,
    pub disk: StorageBackend,
    pub uploaded_chunks: BTreeSet<u32>,
    /// Blob prefix holding this session's chunks.
    pub temp_prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn uploaded_count(&self) -> u32 {
        self.uploaded_chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_count() == self.total_chunks
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.uploaded_chunks.contains(&index)
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    /// Blob key of chunk `index`.
    pub fn chunk_key(&self, index: u32) -> String {
        format!("{}/chunk_{}", self.temp_prefix, index)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Request to open a chunked upload session
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct InitUploadRequest {
    /// Original filename
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
    /// Total file size in bytes
    #[validate(range(min = 1))]
    pub total_size: u64,
    /// Number of chunks the client will send
    #[validate(range(min = 1, max = 10000))]
    pub total_chunks: u32,
    /// Destination folder, defaults to `uploads`
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InitUploadResponse {
    pub upload_id: Uuid,
    /// Recommended chunk size in bytes
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadChunkResponse {
    pub message: String,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadProgressResponse {
    pub upload_id: Uuid,
    pub filename: String,
    pub total_size: u64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub complete: bool,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadSession> for UploadProgressResponse {
    fn from(session: &UploadSession) -> Self {
        UploadProgressResponse {
            upload_id: session.id,
            filename: session.filename.clone(),
            total_size: session.total_size,
            uploaded_chunks: session.uploaded_count(),
            total_chunks: session.total_chunks,
            missing_chunks: session.missing_chunks(),
            complete: session.is_complete(),
            expires_at: session.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_chunks: u32, uploaded: &[u32]) -> UploadSession {
        UploadSession {
            id: Uuid::new_v4(),
            filename: "movie.mp4".to_string(),
            total_size: 100,
            total_chunks,
            folder: "uploads".to_string(),
            disk: StorageBackend::S3,
            uploaded_chunks: uploaded.iter().copied().collect(),
            temp_prefix: "temp-uploads/abc".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
        }
    }

    #[test]
    fn completeness_tracks_chunk_set() {
        let s = session(3, &[2, 0]);
        assert_eq!(s.uploaded_count(), 2);
        assert!(!s.is_complete());
        assert_eq!(s.missing_chunks(), vec![1]);

        let s = session(3, &[0, 1, 2]);
        assert!(s.is_complete());
        assert!(s.missing_chunks().is_empty());
    }

    #[test]
    fn chunk_keys_live_under_temp_prefix() {
        let s = session(3, &[]);
        assert_eq!(s.chunk_key(2), "temp-uploads/abc/chunk_2");
    }

    #[test]
    fn init_request_validation() {
        let ok = InitUploadRequest {
            filename: "a.bin".to_string(),
            total_size: 1,
            total_chunks: 1,
            folder: None,
        };
        assert!(ok.validate().is_ok());

        let max_name = InitUploadRequest {
            filename: "x".repeat(crate::constants::MAX_FILENAME_LENGTH),
            ..ok.clone()
        };
        assert!(max_name.validate().is_ok());

        let long_name = InitUploadRequest {
            filename: "x".repeat(crate::constants::MAX_FILENAME_LENGTH + 1),
            ..ok.clone()
        };
        assert!(long_name.validate().is_err());

        let zero_size = InitUploadRequest {
            total_size: 0,
            ..ok.clone()
        };
        assert!(zero_size.validate().is_err());

        let zero_chunks = InitUploadRequest {
            total_chunks: 0,
            ..ok
        };
        assert!(zero_chunks.validate().is_err());
    }
}
