use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::StorageBackend;

/// A finalized upload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub disk: StorageBackend,
    /// Blob key, unique per disk.
    pub path: String,
    pub original_name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Name used for this document inside an archive.
    pub fn entry_name(&self) -> String {
        let base = |s: &str| {
            std::path::Path::new(s)
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        };
        if !self.original_name.trim().is_empty() {
            if let Some(name) = base(&self.original_name) {
                return name;
            }
        }
        base(&self.path).unwrap_or_else(|| format!("document_{}", self.id))
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Document {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Document {
            id: row.get("id"),
            disk: row.get::<String, _>("disk").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse disk: {}", e).into())
            })?,
            path: row.get("path"),
            original_name: row.get("original_name"),
            extension: row.get("extension"),
            size: row.get::<i64, _>("size").max(0) as u64,
            mime_type: row.get("mime_type"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

/// Fields supplied when registering a finalized upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub disk: StorageBackend,
    pub path: String,
    pub original_name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentResponse {
    pub id: i64,
    pub disk: String,
    pub path: String,
    pub original_name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        DocumentResponse {
            id: doc.id,
            disk: doc.disk.to_string(),
            path: doc.path,
            original_name: doc.original_name,
            extension: doc.extension,
            size: doc.size,
            mime_type: doc.mime_type,
            created_at: doc.created_at,
        }
    }
}

/// One page of the document catalog, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DocumentListResponse {
    pub data: Vec<DocumentResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(original_name: &str, path: &str) -> Document {
        Document {
            id: 7,
            disk: StorageBackend::S3,
            path: path.to_string(),
            original_name: original_name.to_string(),
            extension: None,
            size: 1,
            mime_type: "text/plain".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn entry_name_prefers_original_name() {
        assert_eq!(doc("report.pdf", "uploads/x_report.pdf").entry_name(), "report.pdf");
    }

    #[test]
    fn entry_name_falls_back_to_path_basename() {
        assert_eq!(doc("", "uploads/abc_notes.txt").entry_name(), "abc_notes.txt");
    }

    #[test]
    fn entry_name_strips_directories() {
        assert_eq!(doc("../../etc/passwd", "uploads/p").entry_name(), "passwd");
    }
}
