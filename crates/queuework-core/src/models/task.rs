use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BuildArchive,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskType::BuildArchive => write!(f, "build_archive"),
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_archive" => Ok(TaskType::BuildArchive),
            _ => Err(anyhow::anyhow!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// A durable unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Deliveries so far, including the one in progress.
    pub attempts: i32,
    pub max_attempts: i32,
    pub timeout_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.get("id"),
            task_type: row.get::<String, _>("task_type").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse task_type: {}", e).into())
            })?,
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            payload: row.get("payload"),
            result: row.get("result"),
            scheduled_at: row.get("scheduled_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            timeout_seconds: row.get("timeout_seconds"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Task {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Create a new payload from a typed struct.
    pub fn payload_from<P: TaskPayload>(payload: &P) -> serde_json::Value {
        serde_json::to_value(payload).unwrap_or_default()
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> {
    fn task_type() -> TaskType;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArchivePayload {
    pub job_id: Uuid,
}

impl TaskPayload for BuildArchivePayload {
    fn task_type() -> TaskType {
        TaskType::BuildArchive
    }
}
