use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants::{ARCHIVE_PROGRESS_CEILING, ARCHIVE_PROGRESS_STARTED};
use crate::StorageBackend;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ArchiveJobStatus {
    /// A pickup in one of these states is a duplicate execution.
    pub fn is_claimed(&self) -> bool {
        matches!(self, ArchiveJobStatus::Processing | ArchiveJobStatus::Completed)
    }
}

impl Display for ArchiveJobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ArchiveJobStatus::Queued => write!(f, "queued"),
            ArchiveJobStatus::Processing => write!(f, "processing"),
            ArchiveJobStatus::Completed => write!(f, "completed"),
            ArchiveJobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ArchiveJobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ArchiveJobStatus::Queued),
            "processing" => Ok(ArchiveJobStatus::Processing),
            "completed" => Ok(ArchiveJobStatus::Completed),
            "failed" => Ok(ArchiveJobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid archive job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveJob {
    pub id: Uuid,
    pub status: ArchiveJobStatus,
    /// 0..=100
    pub progress: i16,
    /// Ordered, de-duplicated, non-empty.
    pub document_ids: Vec<i64>,
    pub source_disk: Option<StorageBackend>,
    pub archive_disk: Option<StorageBackend>,
    pub result_path: Option<String>,
    pub result_filename: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ArchiveJob {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let disk = |column: &str| -> Result<Option<StorageBackend>, sqlx::Error> {
            row.get::<Option<String>, _>(column)
                .map(|s| s.parse())
                .transpose()
                .map_err(|e: anyhow::Error| {
                    sqlx::Error::Decode(format!("Failed to parse {}: {}", column, e).into())
                })
        };

        Ok(ArchiveJob {
            id: row.get("id"),
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            progress: row.get("progress"),
            document_ids: row.get("document_ids"),
            source_disk: disk("source_disk")?,
            archive_disk: disk("archive_disk")?,
            result_path: row.get("result_path"),
            result_filename: row.get("result_filename"),
            error: row.get("error"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArchiveJob {
    pub document_ids: Vec<i64>,
    pub source_disk: Option<StorageBackend>,
    pub archive_disk: Option<StorageBackend>,
}

/// Progress after `processed` of `total` entries were written.
///
/// Starts at 5 and never passes 95 until the archive is uploaded.
pub fn archive_progress(processed: usize, total: usize) -> i16 {
    let total = total.max(1) as f64;
    let span = f64::from(ARCHIVE_PROGRESS_CEILING - ARCHIVE_PROGRESS_STARTED);
    let step = (span * processed as f64 / total).round() as i16;
    (ARCHIVE_PROGRESS_STARTED + step).min(ARCHIVE_PROGRESS_CEILING)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ArchiveJobStatusResponse {
    pub job_id: Uuid,
    pub status: ArchiveJobStatus,
    pub progress: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_formula() {
        assert_eq!(archive_progress(0, 3), 5);
        assert_eq!(archive_progress(1, 3), 35);
        assert_eq!(archive_progress(2, 3), 65);
        assert_eq!(archive_progress(3, 3), 95);
        assert_eq!(archive_progress(1, 8), 16);
        assert_eq!(archive_progress(1, 2), 50);
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let total = 37;
        let mut last = archive_progress(0, total);
        for processed in 1..=total {
            let p = archive_progress(processed, total);
            assert!(p >= last);
            assert!(p <= 95);
            last = p;
        }
        assert_eq!(last, 95);
    }

    #[test]
    fn status_round_trip_and_claimed() {
        for status in [
            ArchiveJobStatus::Queued,
            ArchiveJobStatus::Processing,
            ArchiveJobStatus::Completed,
            ArchiveJobStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ArchiveJobStatus>().unwrap(), status);
        }
        assert!(ArchiveJobStatus::Processing.is_claimed());
        assert!(ArchiveJobStatus::Completed.is_claimed());
        assert!(!ArchiveJobStatus::Failed.is_claimed());
        assert!(!ArchiveJobStatus::Queued.is_claimed());
    }
}
