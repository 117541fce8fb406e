use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::StreamExt;
use queuework_core::constants::{FALLBACK_MIME_TYPE, UPLOAD_FINALIZE_LEASE_SECS};
use queuework_core::models::{
    Document, InitUploadRequest, InitUploadResponse, NewDocument, UploadChunkResponse,
    UploadProgressResponse, UploadSession,
};
use queuework_core::{AppError, Config, StorageBackend};
use queuework_db::{DocumentRepository, UploadSessionStore};
use queuework_storage::{keys, DiskRegistry, Storage, StorageError, UploadOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use validator::Validate;

use super::mime::{detect_mime_type, SNIFF_LEN};

/// Settings for the chunked upload workflow.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Disk new sessions write to. Must be a remote disk.
    pub disk: StorageBackend,
    pub session_ttl: Duration,
    pub recommended_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
}

impl From<&Config> for UploadConfig {
    fn from(config: &Config) -> Self {
        UploadConfig {
            disk: config.default_disk(),
            session_ttl: Duration::hours(config.upload_session_ttl_hours()),
            recommended_chunk_bytes: config.upload_recommended_chunk_bytes(),
            max_chunk_bytes: config.upload_max_chunk_bytes(),
        }
    }
}

/// Two-phase uploads: chunks land as individual blobs under the session's temp
/// prefix, then finalize joins them into one document.
pub struct ChunkedUploadManager {
    sessions: Arc<dyn UploadSessionStore>,
    documents: Arc<dyn DocumentRepository>,
    disks: DiskRegistry,
    config: UploadConfig,
}

impl ChunkedUploadManager {
    pub fn new(
        sessions: Arc<dyn UploadSessionStore>,
        documents: Arc<dyn DocumentRepository>,
        disks: DiskRegistry,
        config: UploadConfig,
    ) -> Self {
        Self {
            sessions,
            documents,
            disks,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    async fn session(&self, session_id: Uuid) -> Result<UploadSession, AppError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(AppError::SessionNotFound(session_id))
    }

    /// Opens a session. Nothing is written to the disk yet.
    #[tracing::instrument(skip(self, request), fields(filename = %request.filename, total_chunks = request.total_chunks))]
    pub async fn init(&self, request: InitUploadRequest) -> Result<InitUploadResponse, AppError> {
        request.validate()?;

        let basename = keys::file_basename(&request.filename);
        if basename.trim().is_empty() || basename == "." || basename == ".." {
            return Err(AppError::InvalidInput(
                "Filename must name a file".to_string(),
            ));
        }

        if !self.config.disk.is_remote() {
            return Err(AppError::InvalidInput(format!(
                "Chunked uploads require a remote disk, but the default disk is '{}'",
                self.config.disk
            )));
        }
        // Fail now rather than on the first chunk.
        self.disks.get(self.config.disk)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let session = UploadSession {
            id,
            filename: request.filename,
            total_size: request.total_size,
            total_chunks: request.total_chunks,
            folder: keys::sanitize_folder(request.folder.as_deref()),
            disk: self.config.disk,
            uploaded_chunks: Default::default(),
            temp_prefix: keys::temp_prefix(id),
            created_at: now,
            expires_at: now + self.config.session_ttl,
        };
        self.sessions.create(&session).await?;

        tracing::info!(
            session_id = %id,
            folder = %session.folder,
            total_size = session.total_size,
            "Chunked upload session created"
        );

        Ok(InitUploadResponse {
            upload_id: id,
            chunk_size: self.config.recommended_chunk_bytes,
        })
    }

    /// Stores chunk `index`. Re-sending a recorded chunk is a successful no-op.
    #[tracing::instrument(skip(self, data), fields(session_id = %session_id, chunk_index = index, chunk_bytes = data.len()))]
    pub async fn accept_chunk(
        &self,
        session_id: Uuid,
        index: u32,
        data: Bytes,
    ) -> Result<UploadChunkResponse, AppError> {
        let session = self.session(session_id).await?;

        if index >= session.total_chunks {
            return Err(AppError::InvalidChunkIndex {
                index,
                total_chunks: session.total_chunks,
            });
        }

        if session.has_chunk(index) {
            tracing::debug!("Chunk already uploaded");
            return Ok(UploadChunkResponse {
                message: "Chunk already uploaded.".to_string(),
                uploaded_chunks: session.uploaded_count(),
                total_chunks: session.total_chunks,
                complete: session.is_complete(),
            });
        }

        if data.is_empty() {
            return Err(AppError::InvalidInput("Chunk is empty".to_string()));
        }
        if data.len() as u64 > self.config.max_chunk_bytes {
            return Err(AppError::InvalidInput(format!(
                "Chunk of {} bytes exceeds the maximum of {} bytes",
                data.len(),
                self.config.max_chunk_bytes
            )));
        }

        let storage = self.disks.get(session.disk)?;
        let chunk_key = session.chunk_key(index);
        // First writer wins; a racing resend of the same index keeps its blob.
        let written = storage
            .upload_if_absent(&chunk_key, data, FALLBACK_MIME_TYPE)
            .await?;
        if !written {
            tracing::debug!("Chunk blob already stored by another request");
        }

        let Some(updated) = self.sessions.add_chunk(session_id, index).await? else {
            // Aborted or expired while the chunk was in flight.
            if written {
                delete_quietly(storage.as_ref(), &chunk_key).await;
            }
            return Err(AppError::SessionNotFound(session_id));
        };

        tracing::info!(
            progress = %format!("{}/{}", updated.uploaded_count(), updated.total_chunks),
            "Chunk stored"
        );

        Ok(UploadChunkResponse {
            message: "Chunk uploaded successfully.".to_string(),
            uploaded_chunks: updated.uploaded_count(),
            total_chunks: updated.total_chunks,
            complete: updated.is_complete(),
        })
    }

    /// Joins every chunk into one blob and registers it as a document.
    ///
    /// On failure the session and its chunks are left in place so the client
    /// can retry; only the local buffer is removed.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn finalize(&self, session_id: Uuid) -> Result<Document, AppError> {
        let session = self.session(session_id).await?;

        if !session.is_complete() {
            return Err(AppError::IncompleteUpload {
                uploaded: session.uploaded_count(),
                total_chunks: session.total_chunks,
            });
        }

        if !self
            .sessions
            .begin_finalize(session_id, Duration::seconds(UPLOAD_FINALIZE_LEASE_SECS))
            .await?
        {
            return Err(AppError::Conflict(
                "Upload is already being finalized.".to_string(),
            ));
        }

        match self.finalize_claimed(&session).await {
            Ok(document) => Ok(document),
            Err(e) => {
                if let Err(release) = self.sessions.end_finalize(session_id).await {
                    tracing::warn!(error = %release, "Failed to release finalize claim");
                }
                Err(e)
            }
        }
    }

    /// Assembles and registers the document while this call holds the finalize claim.
    async fn finalize_claimed(&self, session: &UploadSession) -> Result<Document, AppError> {
        let storage = self.disks.get(session.disk)?;
        let start = std::time::Instant::now();

        // Removed on drop, whichever way this function returns.
        let buffer = tempfile::Builder::new()
            .prefix("chunked_upload_")
            .tempfile()
            .map_err(|e| AppError::Internal(format!("Failed to create upload buffer: {}", e)))?;
        let (size, head) = combine_chunks(storage.as_ref(), session, buffer.path()).await?;

        if size != session.total_size {
            tracing::warn!(
                expected = session.total_size,
                actual = size,
                "Assembled size differs from the declared total size"
            );
        }

        let mime_type = detect_mime_type(&head, &session.filename);
        let final_key = keys::document_key(&session.folder, &session.filename);
        let original_name = keys::file_basename(&session.filename).to_string();
        // Remote signed URLs cannot rename the download, so the name rides on the object.
        let options = UploadOptions::attachment(&original_name, &mime_type);
        storage
            .upload_file(&final_key, buffer.path(), &options)
            .await?;

        let extension = Path::new(&original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        let document = match self
            .documents
            .create(NewDocument {
                disk: session.disk,
                path: final_key.clone(),
                original_name,
                extension,
                size,
                mime_type,
            })
            .await
        {
            Ok(document) => document,
            Err(e) => {
                delete_quietly(storage.as_ref(), &final_key).await;
                return Err(e);
            }
        };

        for index in 0..session.total_chunks {
            delete_quietly(storage.as_ref(), &session.chunk_key(index)).await;
        }
        if let Err(e) = self.sessions.delete(session.id).await {
            tracing::warn!(error = %e, "Failed to delete finalized upload session");
        }

        tracing::info!(
            document_id = document.id,
            path = %document.path,
            size = document.size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Chunked upload finalized"
        );

        Ok(document)
    }

    /// Drops the session and, best effort, every chunk it recorded.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn abort(&self, session_id: Uuid) -> Result<(), AppError> {
        let session = self.session(session_id).await?;
        self.discard_chunks(&session).await;
        self.sessions.delete(session_id).await?;

        tracing::info!("Chunked upload aborted");
        Ok(())
    }

    pub async fn get_upload_progress(
        &self,
        session_id: Uuid,
    ) -> Result<UploadProgressResponse, AppError> {
        let session = self.session(session_id).await?;
        Ok(UploadProgressResponse::from(&session))
    }

    /// Removes expired sessions and their chunk blobs. Returns how many were purged.
    pub async fn purge_expired_sessions(&self) -> Result<usize, AppError> {
        let expired = self.sessions.purge_expired(Utc::now()).await?;
        for session in &expired {
            self.discard_chunks(session).await;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Purged expired upload sessions");
        }
        Ok(expired.len())
    }

    async fn discard_chunks(&self, session: &UploadSession) {
        let storage = match self.disks.get(session.disk) {
            Ok(storage) => storage,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Cannot clean up chunks");
                return;
            }
        };
        for &index in &session.uploaded_chunks {
            delete_quietly(storage.as_ref(), &session.chunk_key(index)).await;
        }
    }
}

/// Streams chunks `0..total_chunks` in order into `target`. Returns the total
/// size and the leading bytes used for content sniffing.
async fn combine_chunks(
    storage: &dyn Storage,
    session: &UploadSession,
    target: &Path,
) -> Result<(u64, Vec<u8>), AppError> {
    let mut out = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(target)
        .await?;
    let mut size = 0u64;
    let mut head = Vec::with_capacity(SNIFF_LEN);

    for index in 0..session.total_chunks {
        let mut stream = match storage.download_stream(&session.chunk_key(index)).await {
            Ok(stream) => stream,
            Err(StorageError::NotFound(_)) => return Err(AppError::MissingChunk { index }),
            Err(e) => return Err(e.into()),
        };

        while let Some(piece) = stream.next().await {
            let piece = match piece {
                Ok(piece) => piece,
                Err(StorageError::NotFound(_)) => return Err(AppError::MissingChunk { index }),
                Err(e) => return Err(e.into()),
            };
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(piece.len());
                head.extend_from_slice(&piece[..take]);
            }
            out.write_all(&piece).await?;
            size += piece.len() as u64;
        }

        tracing::debug!(chunk_index = index, "Combined chunk");
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((size, head))
}

async fn delete_quietly(storage: &dyn Storage, key: &str) {
    if let Err(e) = storage.delete(key).await {
        tracing::warn!(key = %key, error = %e, "Failed to delete blob");
    }
}
