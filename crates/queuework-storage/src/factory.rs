#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageBackend, StorageError, StorageResult};
use queuework_core::Config;
use std::collections::HashMap;
use std::sync::Arc;

/// Configured disks, keyed by the name stored on documents and jobs.
#[derive(Clone, Default)]
pub struct DiskRegistry {
    disks: HashMap<StorageBackend, Arc<dyn Storage>>,
    #[cfg(feature = "storage-local")]
    local: Option<Arc<LocalStorage>>,
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, disk: StorageBackend, storage: Arc<dyn Storage>) -> Self {
        self.disks.insert(disk, storage);
        self
    }

    /// Registers the local disk, keeping its concrete handle for signed downloads.
    #[cfg(feature = "storage-local")]
    pub fn with_local(mut self, storage: Arc<LocalStorage>) -> Self {
        self.disks.insert(StorageBackend::Local, storage.clone());
        self.local = Some(storage);
        self
    }

    pub fn get(&self, disk: StorageBackend) -> StorageResult<Arc<dyn Storage>> {
        self.disks.get(&disk).cloned().ok_or_else(|| {
            StorageError::ConfigError(format!("Disk '{}' is not configured", disk))
        })
    }

    pub fn contains(&self, disk: StorageBackend) -> bool {
        self.disks.contains_key(&disk)
    }

    #[cfg(feature = "storage-local")]
    pub fn local(&self) -> Option<&Arc<LocalStorage>> {
        self.local.as_ref()
    }
}

/// Create every disk the configuration describes.
///
/// The remote disk is built when a bucket is configured; the local disk when a
/// path is configured. The default and archive disks must both be present.
pub async fn create_disks(config: &Config) -> StorageResult<DiskRegistry> {
    let mut registry = DiskRegistry::new();

    if config.s3_bucket().is_some() {
        registry = add_s3(registry, config).await?;
    }
    if config.local_storage_path().is_some() {
        registry = add_local(registry, config).await?;
    }

    for disk in [config.default_disk(), config.archive_disk()] {
        if !registry.contains(disk) {
            return Err(StorageError::ConfigError(format!(
                "Disk '{}' is selected but not configured",
                disk
            )));
        }
    }

    Ok(registry)
}

#[cfg(feature = "storage-s3")]
async fn add_s3(registry: DiskRegistry, config: &Config) -> StorageResult<DiskRegistry> {
    let bucket = config
        .s3_bucket()
        .map(String::from)
        .ok_or_else(|| StorageError::ConfigError("S3_BUCKET not configured".to_string()))?;
    let region = config
        .s3_region()
        .map(String::from)
        .or_else(|| config.aws_region().map(String::from))
        .ok_or_else(|| {
            StorageError::ConfigError("S3_REGION or AWS_REGION not configured".to_string())
        })?;
    let endpoint = config.s3_endpoint().map(String::from);

    let storage = S3Storage::new(bucket, region, endpoint).await?;
    Ok(registry.with_disk(StorageBackend::S3, Arc::new(storage)))
}

#[cfg(not(feature = "storage-s3"))]
async fn add_s3(_registry: DiskRegistry, _config: &Config) -> StorageResult<DiskRegistry> {
    Err(StorageError::ConfigError(
        "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
    ))
}

#[cfg(feature = "storage-local")]
async fn add_local(registry: DiskRegistry, config: &Config) -> StorageResult<DiskRegistry> {
    let base_path = config
        .local_storage_path()
        .map(String::from)
        .ok_or_else(|| StorageError::ConfigError("LOCAL_STORAGE_PATH not configured".to_string()))?;
    let base_url = config
        .local_storage_base_url()
        .map(String::from)
        .ok_or_else(|| {
            StorageError::ConfigError("LOCAL_STORAGE_BASE_URL not configured".to_string())
        })?;

    let mut storage = LocalStorage::new(base_path, base_url).await?;
    if let Some(secret) = config.signing_secret() {
        storage = storage.with_signing_secret(secret.as_bytes().to_vec());
    }
    Ok(registry.with_local(Arc::new(storage)))
}

#[cfg(not(feature = "storage-local"))]
async fn add_local(_registry: DiskRegistry, _config: &Config) -> StorageResult<DiskRegistry> {
    Err(StorageError::ConfigError(
        "Local storage backend not available (storage-local feature not enabled)".to_string(),
    ))
}
