use async_trait::async_trait;
use queuework_core::models::{Document, NewDocument};
use queuework_core::AppError;
use sqlx::PgPool;

/// Durable catalog of finalized uploads.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Registers a document. A second document on the same disk and path is a conflict.
    async fn create(&self, document: NewDocument) -> Result<Document, AppError>;

    async fn get(&self, id: i64) -> Result<Option<Document>, AppError>;

    /// Documents matching `ids`, in no particular order. Unknown ids are skipped.
    async fn get_many(&self, ids: &[i64]) -> Result<Vec<Document>, AppError>;

    /// Newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Document>, AppError>;

    async fn count(&self) -> Result<i64, AppError>;
}

#[derive(Clone)]
pub struct PostgresDocumentRepository {
    pool: PgPool,
}

impl PostgresDocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentRepository for PostgresDocumentRepository {
    #[tracing::instrument(skip(self, document), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "insert",
        path = %document.path
    ))]
    async fn create(&self, document: NewDocument) -> Result<Document, AppError> {
        let result = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (disk, path, original_name, extension, size, mime_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, disk, path, original_name, extension, size, mime_type,
                      created_at, updated_at
            "#,
        )
        .bind(document.disk.to_string())
        .bind(&document.path)
        .bind(&document.original_name)
        .bind(&document.extension)
        .bind(document.size as i64)
        .bind(&document.mime_type)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(doc) => Ok(doc),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(format!(
                    "A document already exists at {}",
                    document.path
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "documents", db.operation = "select"))]
    async fn get(&self, id: i64) -> Result<Option<Document>, AppError> {
        let doc = sqlx::query_as::<_, Document>(
            r#"
            SELECT id, disk, path, original_name, extension, size, mime_type,
                   created_at, updated_at
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(doc)
    }

    #[tracing::instrument(skip(self, ids), fields(db.system = "postgresql", db.table = "documents", db.operation = "select", count = ids.len()))]
    async fn get_many(&self, ids: &[i64]) -> Result<Vec<Document>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let docs = sqlx::query_as::<_, Document>(
            r#"
            SELECT id, disk, path, original_name, extension, size, mime_type,
                   created_at, updated_at
            FROM documents
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(docs)
    }

    #[tracing::instrument(skip(self), fields(db.system = "postgresql", db.table = "documents", db.operation = "select"))]
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Document>, AppError> {
        let docs = sqlx::query_as::<_, Document>(
            r#"
            SELECT id, disk, path, original_name, extension, size, mime_type,
                   created_at, updated_at
            FROM documents
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(docs)
    }

    async fn count(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
