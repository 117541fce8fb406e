use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuework_core::models::UploadSession;
use queuework_core::AppError;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Session metadata store for chunked uploads.
///
/// Expired sessions behave as absent. The chunk set only grows, and
/// [`UploadSessionStore::add_chunk`] adds one index atomically so concurrent
/// chunk requests never overwrite each other's progress. At most one finalize
/// holds a session at a time.
#[async_trait]
pub trait UploadSessionStore: Send + Sync {
    async fn create(&self, session: &UploadSession) -> Result<(), AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, AppError>;

    /// Records `chunk_index` and returns the updated session, or `None` when the
    /// session is unknown or expired. Recording an index twice is a no-op.
    async fn add_chunk(&self, id: Uuid, chunk_index: u32)
        -> Result<Option<UploadSession>, AppError>;

    /// Claims the session for finalization until `lease` runs out. Returns false
    /// when it is unknown, expired, or already claimed by a live finalize.
    async fn begin_finalize(&self, id: Uuid, lease: chrono::Duration) -> Result<bool, AppError>;

    /// Drops the finalize claim so the session can be finalized again.
    async fn end_finalize(&self, id: Uuid) -> Result<(), AppError>;

    /// Returns true when a session was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, AppError>;

    /// Removes sessions that expired at or before `now` and returns them so the
    /// caller can clean up their chunk blobs.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>, AppError>;
}

#[derive(Clone)]
pub struct PostgresUploadSessionStore {
    pool: PgPool,
}

impl PostgresUploadSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = r#"
    s.id, s.filename, s.total_size, s.total_chunks, s.folder, s.disk, s.temp_prefix,
    s.created_at, s.expires_at,
    COALESCE(
        array_agg(c.chunk_index ORDER BY c.chunk_index) FILTER (WHERE c.chunk_index IS NOT NULL),
        '{}'
    ) AS chunks
"#;

fn session_from_row(row: &PgRow) -> Result<UploadSession, AppError> {
    let chunks: Vec<i32> = row.try_get("chunks")?;
    let disk: String = row.try_get("disk")?;
    Ok(UploadSession {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        total_size: row.try_get::<i64, _>("total_size")?.max(0) as u64,
        total_chunks: row.try_get::<i32, _>("total_chunks")?.max(0) as u32,
        folder: row.try_get("folder")?,
        disk: disk
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid session disk: {}", e)))?,
        uploaded_chunks: chunks.into_iter().map(|i| i.max(0) as u32).collect(),
        temp_prefix: row.try_get("temp_prefix")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[async_trait]
impl UploadSessionStore for PostgresUploadSessionStore {
    #[tracing::instrument(skip(self, session), fields(
        db.system = "postgresql",
        db.table = "upload_sessions",
        db.operation = "insert",
        session_id = %session.id
    ))]
    async fn create(&self, session: &UploadSession) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, filename, total_size, total_chunks, folder, disk, temp_prefix,
                created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(session.id)
        .bind(&session.filename)
        .bind(session.total_size as i64)
        .bind(session.total_chunks as i32)
        .bind(&session.folder)
        .bind(session.disk.to_string())
        .bind(&session.temp_prefix)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_sessions", db.operation = "select"))]
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, AppError> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM upload_sessions s
            LEFT JOIN upload_session_chunks c ON c.session_id = s.id
            WHERE s.id = $1 AND s.expires_at > NOW()
            GROUP BY s.id
            "#
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_session_chunks", db.operation = "insert"))]
    async fn add_chunk(
        &self,
        id: Uuid,
        chunk_index: u32,
    ) -> Result<Option<UploadSession>, AppError> {
        // Set-add: the primary key turns a repeated index into a no-op and the
        // guard skips expired or deleted sessions.
        sqlx::query(
            r#"
            INSERT INTO upload_session_chunks (session_id, chunk_index)
            SELECT $1, $2
            WHERE EXISTS (
                SELECT 1 FROM upload_sessions WHERE id = $1 AND expires_at > NOW()
            )
            ON CONFLICT (session_id, chunk_index) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(chunk_index as i32)
        .execute(&self.pool)
        .await?;

        self.get(id).await
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_sessions", db.operation = "update"))]
    async fn begin_finalize(&self, id: Uuid, lease: chrono::Duration) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET finalizing_until = NOW() + make_interval(secs => $2)
            WHERE id = $1
              AND expires_at > NOW()
              AND (finalizing_until IS NULL OR finalizing_until <= NOW())
            "#,
        )
        .bind(id)
        .bind(lease.num_milliseconds() as f64 / 1000.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_sessions", db.operation = "update"))]
    async fn end_finalize(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE upload_sessions SET finalizing_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_sessions", db.operation = "delete"))]
    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "upload_sessions", db.operation = "delete"))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>, AppError> {
        let query = format!(
            r#"
            WITH expired AS (
                SELECT {SESSION_COLUMNS}
                FROM upload_sessions s
                LEFT JOIN upload_session_chunks c ON c.session_id = s.id
                WHERE s.expires_at <= $1
                GROUP BY s.id
            ),
            removed AS (
                DELETE FROM upload_sessions WHERE id IN (SELECT id FROM expired)
            )
            SELECT * FROM expired
            "#
        );
        let rows = sqlx::query(&query).bind(now).fetch_all(&self.pool).await?;

        let sessions = rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Purged expired upload sessions");
        }

        Ok(sessions)
    }
}
