use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuework_core::AppError;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// A held lease. Only the owner can release it; it lapses on its own at `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Lease based exclusion lock shared by every worker process.
#[async_trait]
pub trait JobLock: Send + Sync {
    /// Takes the lock unless an unexpired lease exists. Never blocks.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError>;

    /// Releases the lease if it is still owned by `lease.owner`.
    async fn release(&self, lease: &LockLease) -> Result<(), AppError>;

    async fn is_held(&self, key: &str) -> Result<bool, AppError>;
}

#[derive(Clone)]
pub struct PostgresJobLock {
    pool: PgPool,
}

impl PostgresJobLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLock for PostgresJobLock {
    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "job_locks", db.operation = "upsert"))]
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError> {
        let owner = Uuid::new_v4();
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            INSERT INTO job_locks (lock_key, owner, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
                SET owner = EXCLUDED.owner,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE job_locks.expires_at <= NOW()
            RETURNING expires_at
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.map(|expires_at| LockLease {
            key: key.to_string(),
            owner,
            expires_at,
        }))
    }

    #[tracing::instrument(skip(self, lease), fields(db.system = "postgresql", db.table = "job_locks", db.operation = "delete", key = %lease.key))]
    async fn release(&self, lease: &LockLease) -> Result<(), AppError> {
        sqlx::query("DELETE FROM job_locks WHERE lock_key = $1 AND owner = $2")
            .bind(&lease.key)
            .bind(lease.owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn is_held(&self, key: &str) -> Result<bool, AppError> {
        let held: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM job_locks WHERE lock_key = $1 AND expires_at > NOW())",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(held)
    }
}
