use crate::signing;
use crate::traits::{
    check_range, validate_key, ByteStream, Storage, StorageError, StorageResult, UploadOptions,
};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Local filesystem storage implementation
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
    signing_secret: Option<Vec<u8>>,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/queuework/files")
    /// * `base_url` - Base URL the API serves files under (e.g., "http://localhost:3000/files")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage {
            base_path,
            base_url,
            signing_secret: None,
        })
    }

    /// Enables signed, expiring download URLs.
    pub fn with_signing_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Checks a download link previously produced by `get_presigned_url`.
    pub fn verify_signed_url(
        &self,
        storage_key: &str,
        expires_at: i64,
        filename: Option<&str>,
        signature: &str,
    ) -> StorageResult<()> {
        let secret = self.signing_secret.as_deref().ok_or_else(|| {
            StorageError::ConfigError("Local disk has no signing secret".to_string())
        })?;
        validate_key(storage_key)?;
        signing::verify(
            secret,
            storage_key,
            expires_at,
            filename,
            signature,
            chrono::Utc::now().timestamp(),
        )
    }

    /// Convert storage key to filesystem path with security validation
    ///
    /// This function validates that the storage key doesn't contain path traversal
    /// sequences that could escape the base storage directory.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;

        let path = self.base_path.join(storage_key);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        if let Ok(canonical) = path.canonicalize() {
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    fn generate_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn open_existing(&self, storage_key: &str, path: &Path) -> StorageResult<fs::File> {
        match fs::File::open(path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::DownloadFailed(format!(
                "Failed to open file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload_with_key(
        &self,
        storage_key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> StorageResult<String> {
        let path = self.key_to_path(storage_key)?;
        let size = data.len();

        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload_with_key successful"
        );

        Ok(self.generate_url(storage_key))
    }

    async fn upload_if_absent(
        &self,
        storage_key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        self.ensure_parent_dir(&path).await?;

        // Written aside and linked into place, so readers never see a partial file.
        let mut staged = path.clone().into_os_string();
        staged.push(format!(".{}.part", uuid::Uuid::new_v4()));
        let staged = PathBuf::from(staged);

        let write = async {
            let mut file = fs::File::create(&staged).await?;
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        let linked = match write {
            Ok(()) => fs::hard_link(&staged, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = fs::remove_file(&staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staged.display(), error = %e, "Failed to remove staged file");
            }
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::UploadFailed(format!(
                "Failed to write file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn upload_file(
        &self,
        storage_key: &str,
        source: &Path,
        _options: &UploadOptions,
    ) -> StorageResult<u64> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        self.ensure_parent_dir(&path).await?;

        let bytes_copied = fs::copy(source, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to copy {} to {}: {}",
                source.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = bytes_copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage file upload successful"
        );

        Ok(bytes_copied)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        let mut file = self.open_existing(storage_key, &path).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(data)
    }

    async fn download_range(
        &self,
        storage_key: &str,
        start: u64,
        end: u64,
    ) -> StorageResult<Bytes> {
        check_range(storage_key, start, end)?;
        let path = self.key_to_path(storage_key)?;
        let mut file = self.open_existing(storage_key, &path).await?;

        let len = file.metadata().await?.len();
        if start >= len {
            return Err(StorageError::InvalidRange {
                key: storage_key.to_string(),
                start,
                end,
            });
        }
        let end = end.min(len - 1);

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.read_exact(&mut buf).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read range of {}: {}", path.display(), e))
        })?;

        Ok(Bytes::from(buf))
    }

    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        let file = self.open_existing(storage_key, &path).await?;

        let reader = tokio_util::io::ReaderStream::new(file);

        let key = storage_key.to_string();
        let path_display = path.display().to_string();
        let stream = reader.map(move |result| {
            result.map_err(|e| {
                tracing::error!(
                    path = %path_display,
                    key = %key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage stream download error"
                );
                StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))
            })
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        tracing::debug!(
            path = %path.display(),
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn get_presigned_url(
        &self,
        storage_key: &str,
        expires_in: Duration,
        download_filename: Option<&str>,
    ) -> StorageResult<String> {
        self.key_to_path(storage_key)?;
        let Some(secret) = self.signing_secret.as_deref() else {
            return Ok(self.generate_url(storage_key));
        };
        let ttl = chrono::Duration::from_std(expires_in)
            .map_err(|e| StorageError::ConfigError(format!("Invalid URL lifetime: {}", e)))?;
        let expires_at = (chrono::Utc::now() + ttl).timestamp();
        signing::signed_url(
            &self.base_url,
            secret,
            storage_key,
            expires_at,
            download_filename,
        )
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        fs::try_exists(&path).await.map_err(|e| {
            StorageError::BackendError(format!("Failed to stat {}: {}", path.display(), e))
        })
    }

    async fn content_length(&self, storage_key: &str) -> StorageResult<u64> {
        let path = self.key_to_path(storage_key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path(), "http://localhost:3000/files".to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_storage_upload_download() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let url = storage
            .upload_with_key("uploads/test.txt", Bytes::from_static(b"test data"), "text/plain")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:3000/files/uploads/test.txt");

        let downloaded = storage.download("uploads/test.txt").await.unwrap();
        assert_eq!(downloaded, b"test data");
        assert_eq!(storage.content_length("uploads/test.txt").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let result = storage.download("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        assert!(storage.download("nope.bin").await.unwrap_err().is_not_found());
        assert!(storage
            .download_range("nope.bin", 0, 10)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(storage.download_stream("nope.bin").await.is_err());
        assert!(storage.content_length("nope.bin").await.unwrap_err().is_not_found());
        assert!(!storage.exists("nope.bin").await.unwrap());
        assert!(storage.delete("nope.bin").await.is_ok());
    }

    #[tokio::test]
    async fn test_exists_reports_stat_failures() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;
        storage
            .upload_with_key("plain.txt", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        assert!(storage.exists("plain.txt").await.unwrap());
        assert!(!storage.exists("other.txt").await.unwrap());
        // A regular file used as a directory is an error, not a missing blob.
        assert!(matches!(
            storage.exists("plain.txt/child").await,
            Err(StorageError::BackendError(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_if_absent_keeps_the_first_file() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        assert!(storage
            .upload_if_absent("chunks/0", Bytes::from_static(b"first"), "application/octet-stream")
            .await
            .unwrap());
        assert!(!storage
            .upload_if_absent("chunks/0", Bytes::from_static(b"second"), "application/octet-stream")
            .await
            .unwrap());
        assert_eq!(storage.download("chunks/0").await.unwrap(), b"first");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("chunks"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("0")]);
    }

    #[tokio::test]
    async fn test_range_reads_are_inclusive_and_clamped() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;
        storage
            .upload_with_key("r.bin", Bytes::from_static(b"0123456789"), "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(&storage.download_range("r.bin", 0, 3).await.unwrap()[..], b"0123");
        assert_eq!(&storage.download_range("r.bin", 8, 100).await.unwrap()[..], b"89");
        assert!(storage.download_range("r.bin", 10, 12).await.is_err());
        assert!(storage.download_range("r.bin", 5, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_file_and_stream_download() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;

        let src = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(src.path(), b"stream download test").await.unwrap();

        let written = storage
            .upload_file("archives/out.zip", src.path(), &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(written, 20);

        let mut stream = storage.download_stream("archives/out.zip").await.unwrap();
        let mut downloaded = Vec::new();
        while let Some(chunk) = stream.next().await {
            downloaded.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(downloaded, b"stream download test");
    }

    #[tokio::test]
    async fn test_signed_url_round_trip() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await.with_signing_secret(SECRET);

        let url = storage
            .get_presigned_url("archives/a.zip", Duration::from_secs(900), Some("a.zip"))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:3000/files/archives/a.zip?expires="));

        let query = url.split_once('?').unwrap().1;
        let params: std::collections::HashMap<_, _> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let expires: i64 = params["expires"].parse().unwrap();

        assert!(storage
            .verify_signed_url("archives/a.zip", expires, Some("a.zip"), params["signature"])
            .is_ok());
        assert!(storage
            .verify_signed_url("archives/b.zip", expires, Some("a.zip"), params["signature"])
            .is_err());
    }

    #[tokio::test]
    async fn test_unsigned_url_without_secret() {
        let dir = tempdir().unwrap();
        let storage = storage(&dir).await;
        let url = storage
            .get_presigned_url("a.zip", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:3000/files/a.zip");
        assert!(storage.verify_signed_url("a.zip", 0, None, "00").is_err());
    }
}
