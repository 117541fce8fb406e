use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuework_core::constants::{ARCHIVE_PROGRESS_DONE, ARCHIVE_PROGRESS_STARTED};
use queuework_core::models::{ArchiveJob, NewArchiveJob};
use queuework_core::AppError;
use sqlx::PgPool;
use uuid::Uuid;

/// Archive job rows with conditional status transitions.
///
/// Every transition is a single conditional write, so two workers racing on the
/// same row cannot both win.
#[async_trait]
pub trait ArchiveJobRepository: Send + Sync {
    /// Inserts a `queued` job with progress 0.
    async fn create(&self, job: NewArchiveJob) -> Result<ArchiveJob, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<ArchiveJob>, AppError>;

    /// `queued | failed -> processing` with progress 5 and the error cleared.
    /// Returns false when the job is missing or already claimed.
    async fn begin_processing(&self, id: Uuid) -> Result<bool, AppError>;

    /// Raises progress while processing. Lower values are ignored.
    async fn update_progress(&self, id: Uuid, progress: i16) -> Result<(), AppError>;

    /// `processing -> completed` with progress 100.
    async fn mark_completed(
        &self,
        id: Uuid,
        result_path: &str,
        result_filename: &str,
    ) -> Result<bool, AppError>;

    /// `processing -> failed` with progress 0.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, AppError>;

    /// Jobs in `processing` last touched before `older_than`.
    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArchiveJob>, AppError>;

    /// `processing -> queued` with progress 0, for crash recovery.
    async fn requeue(&self, id: Uuid) -> Result<bool, AppError>;
}

const JOB_COLUMNS: &str = r#"
    id, status, progress, document_ids, source_disk, archive_disk,
    result_path, result_filename, error, completed_at, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PostgresArchiveJobRepository {
    pool: PgPool,
}

impl PostgresArchiveJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveJobRepository for PostgresArchiveJobRepository {
    #[tracing::instrument(skip(self, job), fields(
        db.system = "postgresql",
        db.table = "archive_jobs",
        db.operation = "insert",
        documents = job.document_ids.len()
    ))]
    async fn create(&self, job: NewArchiveJob) -> Result<ArchiveJob, AppError> {
        let query = format!(
            r#"
            INSERT INTO archive_jobs (id, status, progress, document_ids, source_disk, archive_disk)
            VALUES ($1, 'queued', 0, $2, $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ArchiveJob>(&query)
            .bind(Uuid::new_v4())
            .bind(&job.document_ids)
            .bind(job.source_disk.map(|d| d.to_string()))
            .bind(job.archive_disk.map(|d| d.to_string()))
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "select"))]
    async fn get(&self, id: Uuid) -> Result<Option<ArchiveJob>, AppError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM archive_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, ArchiveJob>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "update"))]
    async fn begin_processing(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET status = 'processing', progress = $2, error = NULL,
                result_path = NULL, result_filename = NULL, completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'failed')
            "#,
        )
        .bind(id)
        .bind(ARCHIVE_PROGRESS_STARTED)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "update"))]
    async fn update_progress(&self, id: Uuid, progress: i16) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE archive_jobs
            SET progress = GREATEST(progress, $2), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(progress.clamp(0, ARCHIVE_PROGRESS_DONE))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "update"))]
    async fn mark_completed(
        &self,
        id: Uuid,
        result_path: &str,
        result_filename: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET status = 'completed', progress = $2, result_path = $3,
                result_filename = $4, error = NULL, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(ARCHIVE_PROGRESS_DONE)
        .bind(result_path)
        .bind(result_filename)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, error), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "update"))]
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET status = 'failed', progress = 0, error = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "select"))]
    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArchiveJob>, AppError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM archive_jobs
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at
            LIMIT 100
            "#
        );
        let rows = sqlx::query_as::<_, ArchiveJob>(&query)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "archive_jobs", db.operation = "update"))]
    async fn requeue(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE archive_jobs
            SET status = 'queued', progress = 0, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
