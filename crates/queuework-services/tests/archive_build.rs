mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{pattern, read_zip, Harness, Options, RANGE_CHUNK_BYTES};
use queuework_core::models::{
    ArchiveJob, ArchiveJobStatus, NewArchiveJob, Task, TaskType,
};
use queuework_core::{AppError, StorageBackend, TaskError};
use queuework_db::{ArchiveJobRepository, InMemoryArchiveJobRepository};
use queuework_services::BuildOutcome;
use queuework_storage::{
    ByteStream, S3Storage, Storage, StorageError, StorageResult, UploadOptions,
};
use queuework_worker::{TaskHandlerContext, TaskQueue, TaskQueueConfig};
use tokio::sync::Mutex;
use uuid::Uuid;

async fn request(h: &Harness, ids: &[i64]) -> ArchiveJob {
    let job = h.archives.request_archive(ids.to_vec()).await.unwrap();
    // Drain the task the request enqueued; these tests drive the handler directly.
    let task = h.repos.tasks.claim_next_task().await.unwrap().unwrap();
    assert_eq!(task.task_type, TaskType::BuildArchive);
    job
}

async fn job(h: &Harness, id: Uuid) -> ArchiveJob {
    h.repos.archive_jobs.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn entries_follow_document_id_order() {
    let h = Harness::new().await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let b = h
        .seed_document(StorageBackend::S3, "b.bin", &pattern(2500, 1))
        .await;
    let c = h.seed_document(StorageBackend::S3, "c.txt", b"").await;

    let requested = request(&h, &[c, a, b]).await;
    let result = h.handler.run(requested.id).await.unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["entries"], 3);

    let entries = h.read_archive(requested.id).await;
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["c.txt", "a.txt", "b.bin"]);
    assert_eq!(entries[0].1, b"");
    assert_eq!(entries[1].1, b"alpha");
    assert_eq!(entries[2].1, pattern(2500, 1));

    let done = job(&h, requested.id).await;
    assert_eq!(done.status, ArchiveJobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());
    assert!(done.completed_at.is_some());
    let path = done.result_path.unwrap();
    assert!(path.starts_with("queuework/archives/"));
    assert!(path.ends_with(".zip"));
    let filename = done.result_filename.unwrap();
    assert!(filename.starts_with("queuework_") && filename.ends_with(".zip"));

    let status = h.archives.get_job_status(requested.id).await.unwrap();
    assert!(status.download_url.unwrap().contains(&path));
    assert_eq!(status.filename.as_deref(), Some(filename.as_str()));
}

#[tokio::test]
async fn one_missing_blob_of_five_still_completes() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..5u8 {
        ids.push(
            h.seed_document(StorageBackend::S3, &format!("doc{}.bin", i), &pattern(1200, i))
                .await,
        );
    }
    let lost = h.document_path(ids[2]).await;
    h.s3.delete(&lost).await.unwrap();

    let requested = request(&h, &ids).await;
    let result = h.handler.run(requested.id).await.unwrap();
    assert_eq!(result["entries"], 4);
    assert_eq!(result["skipped"], 1);

    let entries = h.read_archive(requested.id).await;
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["doc0.bin", "doc1.bin", "doc3.bin", "doc4.bin"]);
    assert_eq!(entries[2].1, pattern(1200, 3));

    let done = job(&h, requested.id).await;
    assert_eq!(done.status, ArchiveJobStatus::Completed);
    assert_eq!(done.progress, 100);
}

#[tokio::test]
async fn duplicate_names_are_suffixed() {
    let h = Harness::new().await;
    let first = h.seed_document(StorageBackend::S3, "report.pdf", b"one").await;
    let second = h.seed_document(StorageBackend::S3, "report.pdf", b"two").await;

    let requested = request(&h, &[first, second]).await;
    h.handler.run(requested.id).await.unwrap();

    let entries = h.read_archive(requested.id).await;
    assert_eq!(entries[0], ("report.pdf".to_string(), b"one".to_vec()));
    assert_eq!(entries[1], ("report (1).pdf".to_string(), b"two".to_vec()));
}

#[tokio::test]
async fn concurrent_executions_build_once() {
    let h = Harness::new().await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let requested = request(&h, &[a]).await;

    let (first, second) = tokio::join!(h.handler.run(requested.id), h.handler.run(requested.id));
    let statuses = [
        first.unwrap()["status"].as_str().unwrap().to_string(),
        second.unwrap()["status"].as_str().unwrap().to_string(),
    ];
    assert_eq!(
        statuses.iter().filter(|s| s.as_str() == "completed").count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| s.as_str() == "duplicate").count(),
        1
    );

    // A late redelivery changes nothing.
    let before = job(&h, requested.id).await;
    let again = h.handler.run(requested.id).await.unwrap();
    assert_eq!(again["status"], "duplicate");
    let after = job(&h, requested.id).await;
    assert_eq!(before.result_path, after.result_path);
    assert_eq!(before.updated_at, after.updated_at);
}

#[tokio::test]
async fn held_lock_makes_execution_a_duplicate() {
    let h = Harness::new().await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let requested = request(&h, &[a]).await;

    let lease = h
        .repos
        .locks
        .try_acquire(
            &queuework_services::lock_key(requested.id),
            Duration::from_secs(60),
        )
        .await
        .unwrap()
        .unwrap();

    let result = h.handler.run(requested.id).await.unwrap();
    assert_eq!(result["status"], "duplicate");
    assert_eq!(job(&h, requested.id).await.status, ArchiveJobStatus::Queued);

    h.repos.locks.release(&lease).await.unwrap();
    let result = h.handler.run(requested.id).await.unwrap();
    assert_eq!(result["status"], "completed");
}

/// Records every progress value written through it.
struct RecordingJobs {
    inner: InMemoryArchiveJobRepository,
    progress: Mutex<Vec<i16>>,
}

#[async_trait]
impl ArchiveJobRepository for RecordingJobs {
    async fn create(&self, job: NewArchiveJob) -> Result<ArchiveJob, AppError> {
        self.inner.create(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ArchiveJob>, AppError> {
        self.inner.get(id).await
    }

    async fn begin_processing(&self, id: Uuid) -> Result<bool, AppError> {
        let claimed = self.inner.begin_processing(id).await?;
        if claimed {
            self.progress.lock().await.push(5);
        }
        Ok(claimed)
    }

    async fn update_progress(&self, id: Uuid, progress: i16) -> Result<(), AppError> {
        self.progress.lock().await.push(progress);
        self.inner.update_progress(id, progress).await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result_path: &str,
        result_filename: &str,
    ) -> Result<bool, AppError> {
        let done = self
            .inner
            .mark_completed(id, result_path, result_filename)
            .await?;
        if done {
            self.progress.lock().await.push(100);
        }
        Ok(done)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, AppError> {
        self.inner.mark_failed(id, error).await
    }

    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArchiveJob>, AppError> {
        self.inner.list_stale_processing(older_than).await
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, AppError> {
        self.inner.requeue(id).await
    }
}

#[tokio::test]
async fn progress_is_monotonic_and_tops_out_at_95() {
    let jobs = Arc::new(RecordingJobs {
        inner: InMemoryArchiveJobRepository::new(),
        progress: Mutex::new(Vec::new()),
    });
    let h = Harness::with_options(Options {
        archive_jobs: Some(jobs.clone()),
        ..Options::default()
    })
    .await;

    let mut ids = Vec::new();
    for i in 0..8u8 {
        ids.push(
            h.seed_document(StorageBackend::S3, &format!("p{}.bin", i), &pattern(300, i))
                .await,
        );
    }
    let requested = request(&h, &ids).await;
    h.handler.run(requested.id).await.unwrap();

    let progress = jobs.progress.lock().await.clone();
    assert_eq!(progress.first(), Some(&5));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress[progress.len() - 2], 95);
    assert!(progress[..progress.len() - 1].iter().all(|p| *p <= 95));
    // begin + one per entry + completion
    assert_eq!(progress.len(), 1 + 8 + 1);
}

#[tokio::test]
async fn job_without_documents_fails_permanently() {
    let h = Harness::new().await;
    let created = h
        .repos
        .archive_jobs
        .create(NewArchiveJob {
            document_ids: vec![404, 405],
            source_disk: Some(StorageBackend::S3),
            archive_disk: Some(StorageBackend::S3),
        })
        .await
        .unwrap();

    let err = h.handler.run(created.id).await.unwrap_err();
    let task_err = err.downcast_ref::<TaskError>().unwrap();
    assert!(!task_err.is_recoverable());
    assert!(err.to_string().starts_with("Archive build failed: "));

    let failed = job(&h, created.id).await;
    assert_eq!(failed.status, ArchiveJobStatus::Failed);
    assert_eq!(failed.progress, 0);
    assert_eq!(
        failed.error.as_deref(),
        Some("No documents found for the requested job.")
    );
    assert!(failed.result_path.is_none());
}

#[tokio::test]
async fn unknown_job_is_unrecoverable() {
    let h = Harness::new().await;
    let err = h.handler.run(Uuid::new_v4()).await.unwrap_err();
    assert!(!err.downcast_ref::<TaskError>().unwrap().is_recoverable());
}

#[tokio::test]
async fn local_documents_are_streamed() {
    let h = Harness::new().await;
    let a = h
        .seed_document(StorageBackend::Local, "local.bin", &pattern(4096, 9))
        .await;
    let b = h.seed_document(StorageBackend::Local, "notes.txt", b"notes").await;

    // Requests only accept remote documents; build a local job directly.
    let created = h
        .repos
        .archive_jobs
        .create(NewArchiveJob {
            document_ids: vec![a, b],
            source_disk: Some(StorageBackend::Local),
            archive_disk: Some(StorageBackend::Local),
        })
        .await
        .unwrap();
    assert!(h.repos.archive_jobs.begin_processing(created.id).await.unwrap());

    let outcome = h.builder.build(&created).await.unwrap();
    let BuildOutcome::Completed { result_path, entries, .. } = outcome else {
        panic!("unexpected outcome: {:?}", outcome);
    };
    assert_eq!(entries, 2);

    let bytes = h.local.download(&result_path).await.unwrap();
    let entries = read_zip(bytes);
    assert_eq!(entries[0], ("local.bin".to_string(), pattern(4096, 9)));
    assert_eq!(entries[1], ("notes.txt".to_string(), b"notes".to_vec()));

    let status = h.archives.get_job_status(created.id).await.unwrap();
    let url = status.download_url.unwrap();
    assert!(url.starts_with("http://localhost:4000/files/"));
    assert!(url.contains("signature="));
}

/// Remote disk whose ranged reads never finish in time.
struct SlowStorage {
    inner: Arc<dyn Storage>,
}

#[async_trait]
impl Storage for SlowStorage {
    async fn upload_with_key(&self, key: &str, data: Bytes, ct: &str) -> StorageResult<String> {
        self.inner.upload_with_key(key, data, ct).await
    }

    async fn upload_if_absent(&self, key: &str, data: Bytes, ct: &str) -> StorageResult<bool> {
        self.inner.upload_if_absent(key, data, ct).await
    }

    async fn upload_file(
        &self,
        key: &str,
        source: &Path,
        options: &UploadOptions,
    ) -> StorageResult<u64> {
        self.inner.upload_file(key, source, options).await
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.inner.download(key).await
    }

    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.inner.download_range(key, start, end).await
    }

    async fn download_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.download_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn get_presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        filename: Option<&str>,
    ) -> StorageResult<String> {
        self.inner.get_presigned_url(key, expires_in, filename).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn content_length(&self, key: &str) -> StorageResult<u64> {
        self.inner.content_length(key).await
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

#[tokio::test]
async fn timed_out_build_fails_the_job() {
    let inner: Arc<dyn Storage> = Arc::new(S3Storage::from_store(
        Arc::new(object_store::memory::InMemory::new()),
        "slow",
    ));
    let h = Harness::with_options(Options {
        job_timeout: Duration::from_millis(100),
        remote: Some(Arc::new(SlowStorage { inner })),
        ..Options::default()
    })
    .await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let requested = request(&h, &[a]).await;

    let err = h.handler.run(requested.id).await.unwrap_err();
    assert!(!err.downcast_ref::<TaskError>().unwrap().is_recoverable());

    let failed = job(&h, requested.id).await;
    assert_eq!(failed.status, ArchiveJobStatus::Failed);
    assert_eq!(failed.progress, 0);
    assert_eq!(failed.error.as_deref(), Some("Archive build timed out"));

    // The lock was released with the terminal state.
    assert!(!h
        .repos
        .locks
        .is_held(&queuework_services::lock_key(requested.id))
        .await
        .unwrap());
}

/// Remote disk that fails the first `upload_file` calls and can pull the
/// scratch directory out from under a running build.
struct FaultyStorage {
    inner: Arc<dyn Storage>,
    upload_failures: AtomicUsize,
    remove_on_read: std::sync::Mutex<Option<PathBuf>>,
}

impl FaultyStorage {
    fn new(upload_failures: usize, remove_on_read: Option<PathBuf>) -> Self {
        FaultyStorage {
            inner: Arc::new(S3Storage::from_store(
                Arc::new(object_store::memory::InMemory::new()),
                "faulty",
            )),
            upload_failures: AtomicUsize::new(upload_failures),
            remove_on_read: std::sync::Mutex::new(remove_on_read),
        }
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn upload_with_key(&self, key: &str, data: Bytes, ct: &str) -> StorageResult<String> {
        self.inner.upload_with_key(key, data, ct).await
    }

    async fn upload_if_absent(&self, key: &str, data: Bytes, ct: &str) -> StorageResult<bool> {
        self.inner.upload_if_absent(key, data, ct).await
    }

    async fn upload_file(
        &self,
        key: &str,
        source: &Path,
        options: &UploadOptions,
    ) -> StorageResult<u64> {
        let failing = self
            .upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::UploadFailed("connection reset".to_string()));
        }
        self.inner.upload_file(key, source, options).await
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.inner.download(key).await
    }

    async fn download_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        self.inner.download_range(key, start, end).await
    }

    async fn download_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.download_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn get_presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        filename: Option<&str>,
    ) -> StorageResult<String> {
        self.inner.get_presigned_url(key, expires_in, filename).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn content_length(&self, key: &str) -> StorageResult<u64> {
        let dir = self.remove_on_read.lock().unwrap().take();
        if let Some(dir) = dir {
            std::fs::remove_dir_all(dir).unwrap();
        }
        self.inner.content_length(key).await
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

#[tokio::test]
async fn failed_upload_is_retried_to_completion() {
    let h = Harness::with_options(Options {
        remote: Some(Arc::new(FaultyStorage::new(1, None))),
        ..Options::default()
    })
    .await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let b = h.seed_document(StorageBackend::S3, "b.txt", b"beta").await;
    let requested = request(&h, &[a, b]).await;

    let err = h.handler.run(requested.id).await.unwrap_err();
    assert!(err.downcast_ref::<TaskError>().unwrap().is_recoverable());
    let failed = job(&h, requested.id).await;
    assert_eq!(failed.status, ArchiveJobStatus::Failed);
    assert!(failed.error.unwrap().contains("connection reset"));

    // The queue's redelivery.
    h.handler.run(requested.id).await.unwrap();
    let done = job(&h, requested.id).await;
    assert_eq!(done.status, ArchiveJobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());

    let entries = h.read_archive(requested.id).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("a.txt".to_string(), b"alpha".to_vec()));
}

#[tokio::test]
async fn scratch_failure_fails_the_job_instead_of_skipping() {
    let scratch = tempfile::TempDir::new().unwrap();
    let scratch_dir = scratch.path().join("spool");
    std::fs::create_dir(&scratch_dir).unwrap();
    let h = Harness::with_options(Options {
        // Reading the first document removes the scratch dir.
        remote: Some(Arc::new(FaultyStorage::new(0, Some(scratch_dir.clone())))),
        scratch_dir: Some(scratch_dir),
        ..Options::default()
    })
    .await;
    let a = h.seed_document(StorageBackend::S3, "a.txt", b"alpha").await;
    let b = h.seed_document(StorageBackend::S3, "b.txt", b"beta").await;
    let requested = request(&h, &[a, b]).await;

    let err = h.handler.run(requested.id).await.unwrap_err();
    assert!(!err.downcast_ref::<TaskError>().unwrap().is_recoverable());

    let failed = job(&h, requested.id).await;
    assert_eq!(failed.status, ArchiveJobStatus::Failed);
    assert!(failed
        .error
        .unwrap()
        .starts_with("Unable to allocate temporary storage for archive"));
    assert!(failed.result_path.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn build_leaves_the_runtime_responsive() {
    const SIZE: usize = 64 * 1024 * 1024;
    let h = Harness::new().await;
    let a = h
        .seed_document(StorageBackend::Local, "large.bin", &pattern(SIZE, 3))
        .await;
    let created = h
        .repos
        .archive_jobs
        .create(NewArchiveJob {
            document_ids: vec![a],
            source_disk: Some(StorageBackend::Local),
            archive_disk: Some(StorageBackend::Local),
        })
        .await
        .unwrap();
    assert!(h.repos.archive_jobs.begin_processing(created.id).await.unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = tokio::spawn({
        let stop = stop.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            let mut last = Instant::now();
            let mut longest = Duration::ZERO;
            while !stop.load(Ordering::SeqCst) {
                interval.tick().await;
                longest = longest.max(last.elapsed());
                last = Instant::now();
            }
            longest
        }
    });
    let outcome = h.builder.build(&created).await.unwrap();
    stop.store(true, Ordering::SeqCst);
    let longest = ticker.await.unwrap();

    assert!(matches!(outcome, BuildOutcome::Completed { entries: 1, .. }));
    assert!(
        longest < Duration::from_millis(250),
        "runtime stalled for {:?}",
        longest
    );
}

struct Dispatcher {
    handler: Arc<queuework_services::ArchiveTaskHandler>,
}

#[async_trait]
impl TaskHandlerContext for Dispatcher {
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> anyhow::Result<serde_json::Value> {
        match task.task_type {
            TaskType::BuildArchive => self.handler.process(task).await,
        }
    }
}

#[tokio::test]
async fn queued_request_is_built_by_the_worker_pool() {
    let h = Harness::new().await;
    let a = h
        .seed_document(StorageBackend::S3, "a.bin", &pattern(RANGE_CHUNK_BYTES as usize * 3 + 1, 4))
        .await;

    let dispatcher: Arc<dyn TaskHandlerContext> = Arc::new(Dispatcher {
        handler: h.handler.clone(),
    });
    let weak: Weak<dyn TaskHandlerContext> = Arc::downgrade(&dispatcher);
    let queue = TaskQueue::new(
        h.repos.tasks.clone(),
        TaskQueueConfig {
            poll_interval_ms: 10,
            ..TaskQueueConfig::default()
        },
        weak,
    );

    let requested = h.archives.request_archive(vec![a]).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = h.archives.get_job_status(requested.id).await.unwrap();
        if status.status == ArchiveJobStatus::Completed {
            assert_eq!(status.progress, 100);
            assert!(status.download_url.is_some());
            break;
        }
        assert_ne!(status.status, ArchiveJobStatus::Failed, "{:?}", status.error);
        assert!(tokio::time::Instant::now() < deadline, "archive never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    queue.shutdown().await;

    let entries = h.read_archive(requested.id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, pattern(RANGE_CHUNK_BYTES as usize * 3 + 1, 4));
}
