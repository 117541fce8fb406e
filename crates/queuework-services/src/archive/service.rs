use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queuework_core::constants::{DEFAULT_DOCUMENT_PAGE_SIZE, MAX_DOCUMENT_PAGE_SIZE};
use queuework_core::models::{
    ArchiveJob, ArchiveJobStatus, ArchiveJobStatusResponse, BuildArchivePayload,
    DocumentListResponse, DocumentResponse, NewArchiveJob,
};
use queuework_core::{AppError, Config, StorageBackend};
use queuework_db::{ArchiveJobRepository, DocumentRepository, JobLock};
use queuework_storage::{keys, DiskRegistry};
use queuework_worker::TaskQueue;
use uuid::Uuid;

use super::builder::lock_key;

/// Extra time the queue allows a build task beyond the build's own timeout,
/// so the build timeout always fires first.
const TASK_TIMEOUT_SLACK_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ArchiveServiceConfig {
    /// Archive disk recorded on new jobs. Defaults to the documents' disk.
    pub archive_disk: Option<StorageBackend>,
    /// Used for jobs that recorded no disk at all.
    pub default_disk: StorageBackend,
    pub download_ttl: Duration,
    pub job_timeout: Duration,
}

impl From<&Config> for ArchiveServiceConfig {
    fn from(config: &Config) -> Self {
        ArchiveServiceConfig {
            archive_disk: Some(config.archive_disk()),
            default_disk: config.default_disk(),
            download_ttl: Duration::from_secs(config.zip_download_ttl_minutes() * 60),
            job_timeout: Duration::from_secs(config.archive_job_timeout_seconds()),
        }
    }
}

/// Entry points for archive jobs: request, status, and crash recovery.
pub struct ArchiveService {
    documents: Arc<dyn DocumentRepository>,
    archive_jobs: Arc<dyn ArchiveJobRepository>,
    locks: Arc<dyn JobLock>,
    task_queue: TaskQueue,
    disks: DiskRegistry,
    config: ArchiveServiceConfig,
}

impl ArchiveService {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        archive_jobs: Arc<dyn ArchiveJobRepository>,
        locks: Arc<dyn JobLock>,
        task_queue: TaskQueue,
        disks: DiskRegistry,
        config: ArchiveServiceConfig,
    ) -> Self {
        Self {
            documents,
            archive_jobs,
            locks,
            task_queue,
            disks,
            config,
        }
    }

    fn task_timeout_seconds(&self) -> i32 {
        let secs = self.config.job_timeout.as_secs() + TASK_TIMEOUT_SLACK_SECS;
        i32::try_from(secs).unwrap_or(i32::MAX)
    }

    async fn enqueue_build(&self, job_id: Uuid) -> Result<Uuid, AppError> {
        let task_id = self
            .task_queue
            .submit(
                &BuildArchivePayload { job_id },
                Some(self.task_timeout_seconds()),
            )
            .await?;
        Ok(task_id)
    }

    /// Validates the selection, records a queued job and enqueues one build task.
    #[tracing::instrument(skip(self, document_ids), fields(requested = document_ids.len()))]
    pub async fn request_archive(&self, document_ids: Vec<i64>) -> Result<ArchiveJob, AppError> {
        let mut seen = HashSet::new();
        let document_ids: Vec<i64> = document_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        if document_ids.is_empty() {
            return Err(AppError::InvalidInput(
                "document_ids must contain at least one id".to_string(),
            ));
        }

        let documents = self.documents.get_many(&document_ids).await?;
        let found: HashSet<i64> = documents.iter().map(|d| d.id).collect();
        let missing: Vec<i64> = document_ids
            .iter()
            .copied()
            .filter(|id| !found.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::DocumentsNotFound(missing));
        }

        let disks: HashSet<StorageBackend> = documents.iter().map(|d| d.disk).collect();
        let disk = match disks.into_iter().collect::<Vec<_>>().as_slice() {
            [disk] if disk.is_remote() => *disk,
            [disk] => {
                return Err(AppError::MixedDisks(format!(
                    "documents are on the '{}' disk, which is not a remote disk",
                    disk
                )))
            }
            _ => {
                return Err(AppError::MixedDisks(
                    "documents are spread over more than one disk".to_string(),
                ))
            }
        };

        let job = self
            .archive_jobs
            .create(NewArchiveJob {
                document_ids,
                source_disk: Some(disk),
                archive_disk: Some(self.config.archive_disk.unwrap_or(disk)),
            })
            .await?;

        let task_id = self.enqueue_build(job.id).await?;

        tracing::info!(
            job_id = %job.id,
            task_id = %task_id,
            document_ids = ?job.document_ids,
            "Queued archive job"
        );
        Ok(job)
    }

    /// Current state of a job. Completed jobs carry a time-limited download URL.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<ArchiveJobStatusResponse, AppError> {
        let job = self
            .archive_jobs
            .get(job_id)
            .await?
            .ok_or(AppError::JobNotFound(job_id))?;

        let mut response = ArchiveJobStatusResponse {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            download_url: None,
            filename: None,
            expires_in_minutes: None,
            completed_at: job.completed_at,
        };

        if job.status == ArchiveJobStatus::Completed {
            if let Some(result_path) = job.result_path.as_deref() {
                let disk = job
                    .archive_disk
                    .or(self.config.archive_disk)
                    .or(job.source_disk)
                    .unwrap_or(self.config.default_disk);
                let filename = job
                    .result_filename
                    .clone()
                    .unwrap_or_else(|| keys::file_basename(result_path).to_string());

                let storage = self.disks.get(disk)?;
                let url = storage
                    .get_presigned_url(result_path, self.config.download_ttl, Some(&filename))
                    .await?;

                response.download_url = Some(url);
                response.filename = Some(filename);
                response.expires_in_minutes = Some(self.config.download_ttl.as_secs() / 60);
            }
        }

        Ok(response)
    }

    /// One page of documents, newest first. `limit` defaults to 25 and is capped at 100.
    pub async fn list_documents(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<DocumentListResponse, AppError> {
        let limit = limit
            .unwrap_or(DEFAULT_DOCUMENT_PAGE_SIZE)
            .clamp(1, MAX_DOCUMENT_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);

        let documents = self.documents.list(limit, offset).await?;
        let total = self.documents.count().await?;

        Ok(DocumentListResponse {
            data: documents.into_iter().map(DocumentResponse::from).collect(),
            total,
            limit,
            offset,
        })
    }

    /// Re-queues jobs stuck in `processing` whose build lock has lapsed, and
    /// enqueues a fresh build for each. Returns how many were recovered.
    pub async fn recover_stale_jobs(&self, stale_after: chrono::Duration) -> Result<usize, AppError> {
        let stale = self
            .archive_jobs
            .list_stale_processing(Utc::now() - stale_after)
            .await?;

        let mut recovered = 0;
        for job in stale {
            if self.locks.is_held(&lock_key(job.id)).await? {
                continue;
            }
            if !self.archive_jobs.requeue(job.id).await? {
                continue;
            }
            self.enqueue_build(job.id).await?;
            recovered += 1;
            tracing::warn!(job_id = %job.id, "Re-queued stale archive job");
        }
        Ok(recovered)
    }
}
