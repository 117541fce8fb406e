//! In-memory repositories.
//!
//! Same contracts as the PostgreSQL implementations, kept in process memory.
//! Used by tests and by `METADATA_BACKEND=memory` single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuework_core::constants::{ARCHIVE_PROGRESS_DONE, ARCHIVE_PROGRESS_STARTED};
use queuework_core::models::{
    ArchiveJob, ArchiveJobStatus, Document, NewArchiveJob, NewDocument, Task, TaskStatus,
    TaskType, UploadSession,
};
use queuework_core::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ArchiveJobRepository, DocumentRepository, JobLock, LockLease, TaskRepository,
    UploadSessionStore,
};

struct SessionEntry {
    session: UploadSession,
    finalizing_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct InMemoryUploadSessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl InMemoryUploadSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadSessionStore for InMemoryUploadSessionStore {
    async fn create(&self, session: &UploadSession) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(format!(
                "Upload session {} already exists",
                session.id
            )));
        }
        sessions.insert(
            session.id,
            SessionEntry {
                session: session.clone(),
                finalizing_until: None,
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, AppError> {
        let now = Utc::now();
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(&id)
            .map(|e| &e.session)
            .filter(|s| !s.is_expired_at(now))
            .cloned())
    }

    async fn add_chunk(
        &self,
        id: Uuid,
        chunk_index: u32,
    ) -> Result<Option<UploadSession>, AppError> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(entry) if !entry.session.is_expired_at(now) => {
                entry.session.uploaded_chunks.insert(chunk_index);
                Ok(Some(entry.session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn begin_finalize(&self, id: Uuid, lease: chrono::Duration) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(entry)
                if !entry.session.is_expired_at(now)
                    && entry.finalizing_until.map_or(true, |until| until <= now) =>
            {
                entry.finalizing_until = Some(now + lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn end_finalize(&self, id: Uuid) -> Result<(), AppError> {
        if let Some(entry) = self.sessions.lock().await.get_mut(&id) {
            entry.finalizing_until = None;
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.sessions.lock().await.remove(&id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>, AppError> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<Uuid> = sessions
            .values()
            .filter(|e| e.session.is_expired_at(now))
            .map(|e| e.session.id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|e| e.session)
            .collect())
    }
}

#[derive(Default)]
struct DocumentTable {
    next_id: i64,
    rows: HashMap<i64, Document>,
}

#[derive(Clone, Default)]
pub struct InMemoryDocumentRepository {
    table: Arc<Mutex<DocumentTable>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn create(&self, document: NewDocument) -> Result<Document, AppError> {
        let mut table = self.table.lock().await;
        if table
            .rows
            .values()
            .any(|d| d.disk == document.disk && d.path == document.path)
        {
            return Err(AppError::Conflict(format!(
                "A document already exists at {}",
                document.path
            )));
        }
        table.next_id += 1;
        let now = Utc::now();
        let doc = Document {
            id: table.next_id,
            disk: document.disk,
            path: document.path,
            original_name: document.original_name,
            extension: document.extension,
            size: document.size,
            mime_type: document.mime_type,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn get(&self, id: i64) -> Result<Option<Document>, AppError> {
        Ok(self.table.lock().await.rows.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[i64]) -> Result<Vec<Document>, AppError> {
        let table = self.table.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.rows.get(id).cloned())
            .collect())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Document>, AppError> {
        let table = self.table.lock().await;
        let mut docs: Vec<Document> = table.rows.values().cloned().collect();
        docs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(docs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self) -> Result<i64, AppError> {
        Ok(self.table.lock().await.rows.len() as i64)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryArchiveJobRepository {
    jobs: Arc<Mutex<HashMap<Uuid, ArchiveJob>>>,
}

impl InMemoryArchiveJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a job row. Lets tests stage crash states.
    pub async fn put(&self, job: ArchiveJob) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl ArchiveJobRepository for InMemoryArchiveJobRepository {
    async fn create(&self, job: NewArchiveJob) -> Result<ArchiveJob, AppError> {
        let now = Utc::now();
        let row = ArchiveJob {
            id: Uuid::new_v4(),
            status: ArchiveJobStatus::Queued,
            progress: 0,
            document_ids: job.document_ids,
            source_disk: job.source_disk,
            archive_disk: job.archive_disk,
            result_path: None,
            result_filename: None,
            error: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ArchiveJob>, AppError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn begin_processing(&self, id: Uuid) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if !job.status.is_claimed() => {
                job.status = ArchiveJobStatus::Processing;
                job.progress = ARCHIVE_PROGRESS_STARTED;
                job.error = None;
                job.result_path = None;
                job.result_filename = None;
                job.completed_at = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: Uuid, progress: i16) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == ArchiveJobStatus::Processing {
                job.progress = job.progress.max(progress.clamp(0, ARCHIVE_PROGRESS_DONE));
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result_path: &str,
        result_filename: &str,
    ) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == ArchiveJobStatus::Processing => {
                let now = Utc::now();
                job.status = ArchiveJobStatus::Completed;
                job.progress = ARCHIVE_PROGRESS_DONE;
                job.result_path = Some(result_path.to_string());
                job.result_filename = Some(result_filename.to_string());
                job.error = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == ArchiveJobStatus::Processing => {
                job.status = ArchiveJobStatus::Failed;
                job.progress = 0;
                job.error = Some(error.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArchiveJob>, AppError> {
        let jobs = self.jobs.lock().await;
        let mut stale: Vec<ArchiveJob> = jobs
            .values()
            .filter(|j| j.status == ArchiveJobStatus::Processing && j.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == ArchiveJobStatus::Processing => {
                job.status = ArchiveJobStatus::Queued;
                job.progress = 0;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryJobLock {
    leases: Arc<Mutex<HashMap<String, LockLease>>>,
}

impl InMemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLock for InMemoryJobLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::InvalidInput(format!("Invalid lock ttl: {}", e)))?;
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let lease = LockLease {
            key: key.to_string(),
            owner: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), AppError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.key).map(|l| l.owner) == Some(lease.owner) {
            leases.remove(&lease.key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        Ok(self
            .leases
            .lock()
            .await
            .get(key)
            .map(|l| l.expires_at > now)
            .unwrap_or(false))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task, oldest first.
    pub async fn all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
        max_attempts: i32,
        timeout_seconds: Option<i32>,
    ) -> Result<Task, AppError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Pending,
            payload,
            result: None,
            scheduled_at: scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            timeout_seconds,
            created_at: now,
            updated_at: now,
        };
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn claim_next_task(&self) -> Result<Option<Task>, AppError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;
        let next = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.scheduled_at <= now)
            .min_by_key(|t| (t.scheduled_at, t.created_at))
            .map(|t| t.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| AppError::Internal("Claimed task vanished".to_string()))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.attempts += 1;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError> {
        let now = Utc::now();
        if let Some(task) = self.tasks.lock().await.get_mut(&id) {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.completed_at = Some(now);
            task.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, result: serde_json::Value) -> Result<(), AppError> {
        let now = Utc::now();
        if let Some(task) = self.tasks.lock().await.get_mut(&id) {
            task.status = TaskStatus::Failed;
            task.result = Some(result);
            task.completed_at = Some(now);
            task.updated_at = now;
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        last_error: serde_json::Value,
    ) -> Result<(), AppError> {
        if let Some(task) = self.tasks.lock().await.get_mut(&id) {
            task.status = TaskStatus::Pending;
            task.scheduled_at = scheduled_at;
            task.started_at = None;
            task.result = Some(last_error);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut reaped = 0;
        for task in self.tasks.lock().await.values_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };
            let budget = i64::from(task.timeout_seconds.unwrap_or(3600)) + grace_period_secs;
            if started_at + chrono::Duration::seconds(budget) >= now {
                continue;
            }
            if task.can_retry() {
                task.status = TaskStatus::Pending;
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
            }
            task.started_at = None;
            task.scheduled_at = now;
            task.result = Some(serde_json::json!({
                "error": "Task exceeded its timeout and was reaped"
            }));
            task.updated_at = now;
            reaped += 1;
        }
        Ok(reaped)
    }
}
