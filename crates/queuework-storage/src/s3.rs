use crate::traits::{
    check_range, validate_key, ByteStream, Storage, StorageError, StorageResult, UploadOptions,
};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::Method;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, Attributes, ObjectStore, ObjectStoreExt, PutMode, PutOptions, PutPayload,
    Result as ObjectResult, WriteMultipart,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Read buffer used when streaming a local file into a multipart upload.
const UPLOAD_READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Object store backed disk (S3 and S3-compatible providers).
#[derive(Clone)]
pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    bucket: String,
    region: String,
    endpoint_url: Option<String>, // Custom endpoint for S3-compatible providers
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region.clone())
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = Arc::new(
            builder
                .build()
                .map_err(|e| StorageError::ConfigError(e.to_string()))?,
        );

        Ok(S3Storage {
            store: store.clone(),
            signer: Some(store),
            bucket,
            region,
            endpoint_url,
        })
    }

    /// Wrap an already built store. Without a signer, download URLs are plain
    /// object URLs.
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        S3Storage {
            store,
            signer: None,
            bucket: bucket.into(),
            region: String::new(),
            endpoint_url: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    fn location(storage_key: &str) -> StorageResult<Path> {
        validate_key(storage_key)?;
        Ok(Path::from(storage_key))
    }

    /// Generate public URL for S3 object
    ///
    /// For AWS S3, uses the standard format: https://{bucket}.s3.{region}.amazonaws.com/{key}
    /// For S3-compatible providers, uses path-style: {endpoint}/{bucket}/{key}
    fn generate_url(&self, key: &str) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key)
        } else if self.region.is_empty() {
            format!("s3://{}/{}", self.bucket, key)
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            )
        }
    }

    fn map_read_error(&self, storage_key: &str, err: ObjectStoreError) -> StorageError {
        match err {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(storage_key.to_string()),
            other => {
                tracing::error!(
                    error = %other,
                    bucket = %self.bucket,
                    key = %storage_key,
                    "S3 read failed"
                );
                StorageError::DownloadFailed(other.to_string())
            }
        }
    }
}

fn attributes_for(options: &UploadOptions) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(ref content_type) = options.content_type {
        attributes.insert(Attribute::ContentType, content_type.clone().into());
    }
    if let Some(ref disposition) = options.content_disposition {
        attributes.insert(Attribute::ContentDisposition, disposition.clone().into());
    }
    attributes
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload_with_key(
        &self,
        storage_key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> StorageResult<String> {
        let size = data.len() as u64;
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        let result: ObjectResult<_> = self.store.put(&location, PutPayload::from(data)).await;

        result.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload_with_key failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload_with_key successful"
        );

        Ok(self.generate_url(storage_key))
    }

    async fn upload_if_absent(
        &self,
        storage_key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> StorageResult<bool> {
        let size = data.len() as u64;
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        let options = PutOptions::from(PutMode::Create);
        match self
            .store
            .put_opts(&location, PutPayload::from(data), options)
            .await
        {
            Ok(_) => {
                tracing::debug!(
                    bucket = %self.bucket,
                    key = %storage_key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload_if_absent successful"
                );
                Ok(true)
            }
            Err(ObjectStoreError::AlreadyExists { .. }) => {
                tracing::debug!(bucket = %self.bucket, key = %storage_key, "S3 object already exists");
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload_if_absent failed"
                );
                Err(StorageError::UploadFailed(e.to_string()))
            }
        }
    }

    async fn upload_file(
        &self,
        storage_key: &str,
        source: &std::path::Path,
        options: &UploadOptions,
    ) -> StorageResult<u64> {
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        let mut file = tokio::fs::File::open(source).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to open {}: {}", source.display(), e))
        })?;

        let upload = self
            .store
            .put_multipart_opts(&location, attributes_for(options).into())
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        let mut writer = WriteMultipart::new(upload);

        let mut buf = vec![0u8; UPLOAD_READ_BUFFER_BYTES];
        let mut total: u64 = 0;
        let copy_result: StorageResult<()> = async {
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer
                    .wait_for_capacity(1)
                    .await
                    .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
                writer.write(&buf[..n]);
                total += n as u64;
            }
            Ok(())
        }
        .await;

        if let Err(e) = copy_result {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                "S3 multipart upload failed, aborting"
            );
            if let Err(abort_err) = writer.abort().await {
                tracing::warn!(error = %abort_err, key = %storage_key, "Failed to abort multipart upload");
            }
            return Err(e);
        }

        writer.finish().await.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                size_bytes = total,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 multipart upload failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = total,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload successful"
        );

        Ok(total)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let start = std::time::Instant::now();
        let location = Self::location(storage_key)?;

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.map_read_error(storage_key, e))?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = bytes.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(bytes.to_vec())
    }

    async fn download_range(
        &self,
        storage_key: &str,
        start: u64,
        end: u64,
    ) -> StorageResult<Bytes> {
        check_range(storage_key, start, end)?;
        let location = Self::location(storage_key)?;

        self.store
            .get_range(&location, start..end.saturating_add(1))
            .await
            .map_err(|e| self.map_read_error(storage_key, e))
    }

    async fn download_stream(&self, storage_key: &str) -> StorageResult<ByteStream> {
        let start = std::time::Instant::now();
        let location = Self::location(storage_key)?;

        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.map_read_error(storage_key, e))?;

        let bucket = self.bucket.clone();
        let key = storage_key.to_string();

        let stream = result.into_stream().map(move |res| match res {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::error!(
                    bucket = %bucket,
                    key = %key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 stream download error"
                );
                Err(StorageError::DownloadFailed(e.to_string()))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let location = Self::location(storage_key)?;

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                return Err(StorageError::DeleteFailed(e.to_string()));
            }
        }

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn get_presigned_url(
        &self,
        storage_key: &str,
        expires_in: Duration,
        _download_filename: Option<&str>,
    ) -> StorageResult<String> {
        // The signer cannot add response overrides, so download names come from
        // the Content-Disposition stored with the object.
        let location = Self::location(storage_key)?;
        let Some(ref signer) = self.signer else {
            return Ok(self.generate_url(storage_key));
        };

        let url = signer
            .signed_url(Method::GET, &location, expires_in)
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        Ok(url.to_string())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Self::location(storage_key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn content_length(&self, storage_key: &str) -> StorageResult<u64> {
        let location = Self::location(storage_key)?;
        match self.store.head(&location).await {
            Ok(meta) => Ok(meta.size),
            Err(ObjectStoreError::NotFound { .. }) => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

#[cfg(all(test, feature = "storage-s3"))]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn storage() -> (Arc<InMemory>, S3Storage) {
        let memory = Arc::new(InMemory::new());
        let storage = S3Storage::from_store(memory.clone(), "test-bucket");
        (memory, storage)
    }

    #[tokio::test]
    async fn upload_and_download() {
        let (_, storage) = storage();
        let url = storage
            .upload_with_key("uploads/a.txt", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();
        assert_eq!(url, "s3://test-bucket/uploads/a.txt");
        assert_eq!(storage.download("uploads/a.txt").await.unwrap(), b"hello");
        assert_eq!(storage.content_length("uploads/a.txt").await.unwrap(), 5);
        assert!(storage.exists("uploads/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn ranges_are_inclusive() {
        let (_, storage) = storage();
        storage
            .upload_with_key("r.bin", Bytes::from_static(b"0123456789"), "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(&storage.download_range("r.bin", 2, 4).await.unwrap()[..], b"234");
        assert_eq!(&storage.download_range("r.bin", 7, 9).await.unwrap()[..], b"789");
        assert!(storage.download_range("r.bin", 4, 2).await.is_err());
    }

    #[tokio::test]
    async fn missing_objects() {
        let (_, storage) = storage();
        assert!(storage.download("nope").await.unwrap_err().is_not_found());
        assert!(storage.content_length("nope").await.unwrap_err().is_not_found());
        assert!(!storage.exists("nope").await.unwrap());
        assert!(storage.delete("nope").await.is_ok());
    }

    #[tokio::test]
    async fn upload_file_streams_and_sets_attributes() {
        let (memory, storage) = storage();
        let src = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![7u8; 3 * UPLOAD_READ_BUFFER_BYTES + 17];
        tokio::fs::write(src.path(), &payload).await.unwrap();

        let options = UploadOptions::attachment("queuework_20240101_000000.zip", "application/zip");
        let written = storage
            .upload_file("archives/x.zip", src.path(), &options)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);

        let got = memory.get(&Path::from("archives/x.zip")).await.unwrap();
        assert_eq!(
            got.attributes.get(&Attribute::ContentType).map(|v| v.as_ref()),
            Some("application/zip")
        );
        assert!(got
            .attributes
            .get(&Attribute::ContentDisposition)
            .map(|v| v.as_ref().starts_with("attachment;"))
            .unwrap_or(false));
        assert_eq!(got.bytes().await.unwrap().len(), payload.len());
    }

    #[tokio::test]
    async fn upload_if_absent_keeps_the_first_object() {
        let (_, storage) = storage();
        assert!(storage
            .upload_if_absent("chunks/0", Bytes::from_static(b"first"), "application/octet-stream")
            .await
            .unwrap());
        assert!(!storage
            .upload_if_absent("chunks/0", Bytes::from_static(b"second"), "application/octet-stream")
            .await
            .unwrap());
        assert_eq!(storage.download("chunks/0").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn invalid_keys_rejected() {
        let (_, storage) = storage();
        let err = storage.download("../secret").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
