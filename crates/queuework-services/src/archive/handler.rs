use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use queuework_core::models::{BuildArchivePayload, Task};
use queuework_core::{AppError, Config, TaskError, TaskResultExt};
use queuework_db::{ArchiveJobRepository, JobLock};
use serde_json::json;
use uuid::Uuid;

use super::builder::{lock_key, ArchiveBuilder, BuildOutcome};

const TIMEOUT_MESSAGE: &str = "Archive build timed out";

/// Runs `build_archive` tasks: one execution per job at a time, bounded by the
/// job timeout.
pub struct ArchiveTaskHandler {
    builder: Arc<ArchiveBuilder>,
    archive_jobs: Arc<dyn ArchiveJobRepository>,
    locks: Arc<dyn JobLock>,
    lock_ttl: Duration,
    job_timeout: Duration,
}

impl ArchiveTaskHandler {
    pub fn new(
        builder: Arc<ArchiveBuilder>,
        archive_jobs: Arc<dyn ArchiveJobRepository>,
        locks: Arc<dyn JobLock>,
        lock_ttl: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            builder,
            archive_jobs,
            locks,
            lock_ttl,
            job_timeout,
        }
    }

    pub fn from_config(
        builder: Arc<ArchiveBuilder>,
        archive_jobs: Arc<dyn ArchiveJobRepository>,
        locks: Arc<dyn JobLock>,
        config: &Config,
    ) -> Self {
        Self::new(
            builder,
            archive_jobs,
            locks,
            Duration::from_secs(config.archive_lock_ttl_seconds()),
            Duration::from_secs(config.archive_job_timeout_seconds()),
        )
    }

    #[tracing::instrument(skip(self, task), fields(task.id = %task.id, attempt = task.attempts, job_id = tracing::field::Empty))]
    pub async fn process(&self, task: &Task) -> Result<serde_json::Value> {
        let payload: BuildArchivePayload = task
            .try_payload_as()
            .map_err(|e| anyhow!("Failed to parse build archive payload: {}", e))
            .unrecoverable()?;
        tracing::Span::current().record("job_id", payload.job_id.to_string());

        self.run(payload.job_id).await
    }

    /// One execution of the job state machine under the job lock.
    ///
    /// Duplicates resolve to `Ok`. Failures come back as a [`TaskError`] that
    /// tells the queue whether another delivery is worthwhile.
    pub async fn run(&self, job_id: Uuid) -> Result<serde_json::Value> {
        let key = lock_key(job_id);
        let Some(lease) = self
            .locks
            .try_acquire(&key, self.lock_ttl)
            .await
            .map_err(TaskError::recoverable)?
        else {
            tracing::warn!(%job_id, "Archive job is locked by another worker");
            return Ok(duplicate(job_id));
        };

        let result = self.run_locked(job_id).await;

        // The terminal state is already written; a failed release only delays
        // the next pickup until the lease lapses.
        if let Err(e) = self.locks.release(&lease).await {
            tracing::warn!(%job_id, error = %e, "Failed to release archive job lock");
        }
        result
    }

    async fn run_locked(&self, job_id: Uuid) -> Result<serde_json::Value> {
        let job = self
            .archive_jobs
            .get(job_id)
            .await
            .map_err(TaskError::recoverable)?
            .ok_or_else(|| TaskError::unrecoverable(AppError::JobNotFound(job_id)))?;

        if job.status.is_claimed() {
            tracing::warn!(%job_id, status = %job.status, "Archive job already in progress or completed");
            return Ok(duplicate(job_id));
        }
        if !self
            .archive_jobs
            .begin_processing(job_id)
            .await
            .map_err(TaskError::recoverable)?
        {
            return Ok(duplicate(job_id));
        }
        tracing::info!(%job_id, "Archive job processing");

        let outcome = match tokio::time::timeout(self.job_timeout, self.builder.build(&job)).await {
            Ok(outcome) => outcome.map_err(TaskError::recoverable)?,
            Err(_) => {
                tracing::error!(%job_id, timeout_secs = self.job_timeout.as_secs(), "Archive build timed out");
                self.archive_jobs
                    .mark_failed(job_id, TIMEOUT_MESSAGE)
                    .await
                    .map_err(TaskError::recoverable)?;
                BuildOutcome::Failed {
                    error: TIMEOUT_MESSAGE.to_string(),
                    retryable: false,
                }
            }
        };

        match outcome {
            BuildOutcome::Completed {
                result_path,
                result_filename,
                entries,
                skipped,
            } => Ok(json!({
                "job_id": job_id,
                "status": "completed",
                "result_path": result_path,
                "result_filename": result_filename,
                "entries": entries,
                "skipped": skipped,
            })),
            BuildOutcome::Duplicate => Ok(duplicate(job_id)),
            BuildOutcome::Failed { error, retryable } => {
                let err = AppError::ArchiveBuild(format!("job {}: {}", job_id, error));
                Err(if retryable {
                    TaskError::recoverable(err)
                } else {
                    TaskError::unrecoverable(err)
                }
                .into())
            }
        }
    }
}

fn duplicate(job_id: Uuid) -> serde_json::Value {
    json!({ "job_id": job_id, "status": "duplicate" })
}
