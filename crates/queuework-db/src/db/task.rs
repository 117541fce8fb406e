use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuework_core::models::{Task, TaskType};
use queuework_core::AppError;
use sqlx::PgPool;
use uuid::Uuid;

/// Durable task queue storage. Delivery is at least once.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
        max_attempts: i32,
        timeout_seconds: Option<i32>,
    ) -> Result<Task, AppError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError>;

    /// Claims the oldest due pending task: marks it running and counts the delivery.
    async fn claim_next_task(&self) -> Result<Option<Task>, AppError>;

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError>;

    async fn mark_failed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError>;

    /// Puts a running task back to pending, due at `scheduled_at`.
    async fn reschedule(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        last_error: serde_json::Value,
    ) -> Result<(), AppError>;

    /// Running tasks whose timeout plus `grace_period_secs` has elapsed go back to
    /// pending, or to failed when their attempts are used up. Returns the count.
    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64, AppError>;
}

const TASK_COLUMNS: &str = r#"
    id, task_type, status, payload, result, scheduled_at, started_at, completed_at,
    attempts, max_attempts, timeout_seconds, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[tracing::instrument(skip(self, payload), fields(db.system = "postgresql", db.table = "tasks", db.operation = "insert"))]
    async fn create_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
        max_attempts: i32,
        timeout_seconds: Option<i32>,
    ) -> Result<Task, AppError> {
        let query = format!(
            r#"
            INSERT INTO tasks (id, task_type, status, payload, scheduled_at, max_attempts, timeout_seconds)
            VALUES ($1, $2, 'pending', $3, COALESCE($4, NOW()), $5, $6)
            RETURNING {TASK_COLUMNS}
            "#
        );
        let task = sqlx::query_as::<_, Task>(&query)
            .bind(Uuid::new_v4())
            .bind(task_type.to_string())
            .bind(payload)
            .bind(scheduled_at)
            .bind(max_attempts)
            .bind(timeout_seconds)
            .fetch_one(&self.pool)
            .await?;

        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let task = sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "tasks", db.operation = "update"))]
    async fn claim_next_task(&self) -> Result<Option<Task>, AppError> {
        let query = format!(
            r#"
            UPDATE tasks
            SET status = 'running', started_at = NOW(), attempts = attempts + 1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending' AND scheduled_at <= NOW()
                ORDER BY scheduled_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        let task = sqlx::query_as::<_, Task>(&query)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    #[tracing::instrument(skip(self, result), fields(db.system = "postgresql", db.table = "tasks", db.operation = "update"))]
    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', result = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, result), fields(db.system = "postgresql", db.table = "tasks", db.operation = "update"))]
    async fn mark_failed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', result = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, last_error), fields(db.system = "postgresql", db.table = "tasks", db.operation = "update"))]
    async fn reschedule(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        last_error: serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', scheduled_at = $2, started_at = NULL, result = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(scheduled_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "tasks", db.operation = "update"))]
    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                started_at = NULL,
                scheduled_at = NOW(),
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                result = jsonb_build_object('error', 'Task exceeded its timeout and was reaped'),
                updated_at = NOW()
            WHERE status = 'running'
              AND started_at + make_interval(secs => COALESCE(timeout_seconds, 3600) + $1) < NOW()
            "#,
        )
        .bind(grace_period_secs as f64)
        .execute(&self.pool)
        .await?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            tracing::warn!(count = reaped, "Reaped stale running tasks");
        }
        Ok(reaped)
    }
}
