#![allow(dead_code)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use queuework_core::models::NewDocument;
use queuework_core::StorageBackend;
use queuework_db::{ArchiveJobRepository, Repositories};
use queuework_services::{
    ArchiveBuilder, ArchiveBuilderConfig, ArchiveService, ArchiveServiceConfig,
    ArchiveTaskHandler, ChunkedUploadManager, UploadConfig,
};
use queuework_storage::{DiskRegistry, LocalStorage, S3Storage, Storage};
use queuework_worker::{TaskQueue, TaskQueueConfig};
use tempfile::TempDir;
use uuid::Uuid;

pub const RANGE_CHUNK_BYTES: u64 = 1000;

pub struct Options {
    pub job_timeout: Duration,
    pub archive_jobs: Option<Arc<dyn ArchiveJobRepository>>,
    pub remote: Option<Arc<dyn Storage>>,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            job_timeout: Duration::from_secs(30),
            archive_jobs: None,
            remote: None,
            scratch_dir: None,
        }
    }
}

pub struct Harness {
    pub repos: Repositories,
    pub s3: Arc<dyn Storage>,
    pub local: Arc<LocalStorage>,
    pub disks: DiskRegistry,
    pub uploads: ChunkedUploadManager,
    pub archives: ArchiveService,
    pub builder: Arc<ArchiveBuilder>,
    pub handler: Arc<ArchiveTaskHandler>,
    _local_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(Options::default()).await
    }

    pub async fn with_options(options: Options) -> Self {
        let mut repos = Repositories::in_memory();
        if let Some(jobs) = options.archive_jobs {
            repos.archive_jobs = jobs;
        }

        let s3: Arc<dyn Storage> = options.remote.unwrap_or_else(|| {
            Arc::new(S3Storage::from_store(
                Arc::new(object_store::memory::InMemory::new()),
                "queuework-test",
            ))
        });
        let local_dir = TempDir::new().unwrap();
        let local = Arc::new(
            LocalStorage::new(local_dir.path(), "http://localhost:4000/files".to_string())
                .await
                .unwrap()
                .with_signing_secret(b"0123456789abcdef0123456789abcdef".to_vec()),
        );
        let disks = DiskRegistry::new()
            .with_disk(StorageBackend::S3, s3.clone())
            .with_local(local.clone());

        let uploads = ChunkedUploadManager::new(
            repos.sessions.clone(),
            repos.documents.clone(),
            disks.clone(),
            UploadConfig {
                disk: StorageBackend::S3,
                session_ttl: ChronoDuration::hours(24),
                recommended_chunk_bytes: 10 * 1024 * 1024,
                max_chunk_bytes: 64 * 1024 * 1024,
            },
        );

        let builder = Arc::new(ArchiveBuilder::new(
            repos.documents.clone(),
            repos.archive_jobs.clone(),
            disks.clone(),
            ArchiveBuilderConfig {
                default_disk: StorageBackend::S3,
                archive_disk: None,
                archive_prefix: "queuework/archives".to_string(),
                range_chunk_bytes: RANGE_CHUNK_BYTES,
                scratch_dir: options.scratch_dir,
            },
        ));
        let handler = Arc::new(ArchiveTaskHandler::new(
            builder.clone(),
            repos.archive_jobs.clone(),
            repos.locks.clone(),
            Duration::from_secs(7200),
            options.job_timeout,
        ));

        let queue = TaskQueue::new_no_worker(repos.tasks.clone(), TaskQueueConfig::default());
        let archives = ArchiveService::new(
            repos.documents.clone(),
            repos.archive_jobs.clone(),
            repos.locks.clone(),
            queue,
            disks.clone(),
            ArchiveServiceConfig {
                archive_disk: None,
                default_disk: StorageBackend::S3,
                download_ttl: Duration::from_secs(15 * 60),
                job_timeout: options.job_timeout,
            },
        );

        Harness {
            repos,
            s3,
            local,
            disks,
            uploads,
            archives,
            builder,
            handler,
            _local_dir: local_dir,
        }
    }

    /// Writes `contents` to `disk` and registers it as a document.
    pub async fn seed_document(&self, disk: StorageBackend, name: &str, contents: &[u8]) -> i64 {
        let path = format!("uploads/{}_{}", Uuid::new_v4(), name);
        self.disks
            .get(disk)
            .unwrap()
            .upload_with_key(&path, Bytes::copy_from_slice(contents), "application/octet-stream")
            .await
            .unwrap();
        self.repos
            .documents
            .create(NewDocument {
                disk,
                path,
                original_name: name.to_string(),
                extension: None,
                size: contents.len() as u64,
                mime_type: "application/octet-stream".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    pub async fn document_path(&self, id: i64) -> String {
        self.repos.documents.get(id).await.unwrap().unwrap().path
    }

    /// Entries of a completed job's archive, in central directory order.
    pub async fn read_archive(&self, job_id: Uuid) -> Vec<(String, Vec<u8>)> {
        let job = self.repos.archive_jobs.get(job_id).await.unwrap().unwrap();
        let disk = job.archive_disk.unwrap_or(StorageBackend::S3);
        let bytes = self
            .disks
            .get(disk)
            .unwrap()
            .download(job.result_path.as_deref().unwrap())
            .await
            .unwrap();
        read_zip(bytes)
    }
}

pub fn read_zip(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        assert_eq!(file.compression(), zip::CompressionMethod::Stored);
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        entries.push((file.name().to_string(), data));
    }
    entries
}

/// Deterministic filler so entries can be compared byte for byte.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
