//! Database repositories for the data access layer
//!
//! Each repository is a trait with a PostgreSQL implementation next to it. The
//! `memory` module holds in-memory implementations of every trait.

pub mod archive_job;
pub mod document;
pub mod job_lock;
#[cfg(feature = "memory")]
pub mod memory;
pub mod task;
pub mod upload_session;

pub use archive_job::{ArchiveJobRepository, PostgresArchiveJobRepository};
pub use document::{DocumentRepository, PostgresDocumentRepository};
pub use job_lock::{JobLock, LockLease, PostgresJobLock};
#[cfg(feature = "memory")]
pub use memory::{
    InMemoryArchiveJobRepository, InMemoryDocumentRepository, InMemoryJobLock,
    InMemoryTaskRepository, InMemoryUploadSessionStore,
};
pub use task::{PostgresTaskRepository, TaskRepository};
pub use upload_session::{PostgresUploadSessionStore, UploadSessionStore};

use sqlx::PgPool;
use std::sync::Arc;

/// Every repository the services need, behind trait objects.
#[derive(Clone)]
pub struct Repositories {
    pub sessions: Arc<dyn UploadSessionStore>,
    pub documents: Arc<dyn DocumentRepository>,
    pub archive_jobs: Arc<dyn ArchiveJobRepository>,
    pub locks: Arc<dyn JobLock>,
    pub tasks: Arc<dyn TaskRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Repositories {
            sessions: Arc::new(PostgresUploadSessionStore::new(pool.clone())),
            documents: Arc::new(PostgresDocumentRepository::new(pool.clone())),
            archive_jobs: Arc::new(PostgresArchiveJobRepository::new(pool.clone())),
            locks: Arc::new(PostgresJobLock::new(pool.clone())),
            tasks: Arc::new(PostgresTaskRepository::new(pool)),
        }
    }

    #[cfg(feature = "memory")]
    pub fn in_memory() -> Self {
        Repositories {
            sessions: Arc::new(InMemoryUploadSessionStore::new()),
            documents: Arc::new(InMemoryDocumentRepository::new()),
            archive_jobs: Arc::new(InMemoryArchiveJobRepository::new()),
            locks: Arc::new(InMemoryJobLock::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
        }
    }
}
