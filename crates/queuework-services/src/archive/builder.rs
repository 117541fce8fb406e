//! Store-only ZIP builds for archive jobs.
//!
//! Documents are spooled one at a time into a scratch file on local disk, so
//! memory use stays flat however large the documents are. The finished archive
//! is uploaded to the archive disk in one multipart upload.
//!
//! A document that cannot be read from its disk is skipped. A failure of the
//! local scratch files fails the whole job, since the archive would be
//! incomplete in ways no entry can account for. ZIP writes run on the blocking
//! pool.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use futures::StreamExt;
use queuework_core::constants::ARCHIVE_MIME_TYPE;
use queuework_core::models::{archive_progress, ArchiveJob, Document};
use queuework_core::{AppError, Config, StorageBackend};
use queuework_db::{ArchiveJobRepository, DocumentRepository};
use queuework_storage::{keys, DiskRegistry, Storage, StorageError, UploadOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

const ZIP32_LIMIT: u64 = 0xFFFF_FFFF;

#[derive(Debug, Clone)]
pub struct ArchiveBuilderConfig {
    /// Source disk for jobs that do not record one.
    pub default_disk: StorageBackend,
    /// Archive disk for jobs that do not record one. Falls back to the source disk.
    pub archive_disk: Option<StorageBackend>,
    pub archive_prefix: String,
    /// Range size for reads from remote disks.
    pub range_chunk_bytes: u64,
    /// Directory for scratch files. The system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl From<&Config> for ArchiveBuilderConfig {
    fn from(config: &Config) -> Self {
        ArchiveBuilderConfig {
            default_disk: config.default_disk(),
            archive_disk: Some(config.archive_disk()),
            archive_prefix: config.archive_prefix().to_string(),
            range_chunk_bytes: config.archive_range_chunk_bytes(),
            scratch_dir: None,
        }
    }
}

/// How a single execution of an archive job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed {
        result_path: String,
        result_filename: String,
        entries: usize,
        skipped: usize,
    },
    /// Another execution owns or already finished the job. Nothing was changed.
    Duplicate,
    /// The job was marked failed with `error`.
    Failed { error: String, retryable: bool },
}

#[derive(Debug, thiserror::Error)]
enum BuildError {
    #[error("No documents found for the requested job.")]
    NoDocuments,

    #[error("Failed to load documents: {0}")]
    Documents(#[source] AppError),

    #[error("Disk unavailable: {0}")]
    Disk(#[source] StorageError),

    #[error("Unable to allocate temporary storage for archive: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("Failed to write archive entry '{name}': {reason}")]
    Write { name: String, reason: String },

    #[error("Failed to finalize archive: {0}")]
    Finalize(String),

    #[error("Archive writer stopped unexpectedly: {0}")]
    Writer(String),

    #[error("Failed to upload archive to storage: {0}")]
    Upload(#[source] StorageError),
}

impl BuildError {
    /// Transient faults are worth another delivery; the rest will fail again.
    fn is_retryable(&self) -> bool {
        match self {
            BuildError::Documents(e) => matches!(e, AppError::Database(_)),
            BuildError::Upload(e) => !matches!(
                e,
                StorageError::InvalidKey(_) | StorageError::ConfigError(_)
            ),
            _ => false,
        }
    }
}

/// Why a document could not be spooled.
#[derive(Debug, thiserror::Error)]
enum SpoolError {
    /// The source disk failed; the document is skipped.
    #[error("{0}")]
    Source(#[from] StorageError),

    #[error("Empty range {start}-{end} for {key}")]
    EmptyRange { key: String, start: u64, end: u64 },

    /// Local scratch I/O failed; the build cannot go on.
    #[error("{0}")]
    Scratch(#[from] std::io::Error),
}

struct BuiltArchive {
    result_path: String,
    result_filename: String,
    entries: usize,
    skipped: usize,
}

pub struct ArchiveBuilder {
    documents: Arc<dyn DocumentRepository>,
    archive_jobs: Arc<dyn ArchiveJobRepository>,
    disks: DiskRegistry,
    config: ArchiveBuilderConfig,
}

impl ArchiveBuilder {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        archive_jobs: Arc<dyn ArchiveJobRepository>,
        disks: DiskRegistry,
        config: ArchiveBuilderConfig,
    ) -> Self {
        Self {
            documents,
            archive_jobs,
            disks,
            config,
        }
    }

    /// Builds a job that was already moved to `processing` and records its
    /// terminal state. Only a failure to record that state is returned as `Err`.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, documents = job.document_ids.len()))]
    pub async fn build(&self, job: &ArchiveJob) -> Result<BuildOutcome, AppError> {
        let start = std::time::Instant::now();

        match self.assemble(job).await {
            Ok(archive) => {
                let recorded = self
                    .archive_jobs
                    .mark_completed(job.id, &archive.result_path, &archive.result_filename)
                    .await?;
                if !recorded {
                    tracing::warn!(
                        result_path = %archive.result_path,
                        "Job left processing before the archive was recorded; discarding it"
                    );
                    if let Ok(target) = self.disks.get(self.archive_disk(job)) {
                        if let Err(e) = target.delete(&archive.result_path).await {
                            tracing::warn!(error = %e, "Failed to delete orphaned archive");
                        }
                    }
                    return Ok(BuildOutcome::Duplicate);
                }

                tracing::info!(
                    result_path = %archive.result_path,
                    entries = archive.entries,
                    skipped = archive.skipped,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Archive ready"
                );
                Ok(BuildOutcome::Completed {
                    result_path: archive.result_path,
                    result_filename: archive.result_filename,
                    entries: archive.entries,
                    skipped: archive.skipped,
                })
            }
            Err(e) => {
                let error = e.to_string();
                let retryable = e.is_retryable();
                tracing::error!(
                    error = %error,
                    retryable,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Archive build failed"
                );
                self.archive_jobs.mark_failed(job.id, &error).await?;
                Ok(BuildOutcome::Failed { error, retryable })
            }
        }
    }

    fn source_disk(&self, job: &ArchiveJob) -> StorageBackend {
        job.source_disk.unwrap_or(self.config.default_disk)
    }

    fn archive_disk(&self, job: &ArchiveJob) -> StorageBackend {
        job.archive_disk
            .or(self.config.archive_disk)
            .unwrap_or_else(|| self.source_disk(job))
    }

    async fn assemble(&self, job: &ArchiveJob) -> Result<BuiltArchive, BuildError> {
        let documents = self.load_documents(job).await?;
        if documents.is_empty() {
            return Err(BuildError::NoDocuments);
        }

        let source_disk = self.source_disk(job);
        let archive_disk = self.archive_disk(job);
        let source = self.disks.get(source_disk).map_err(BuildError::Disk)?;
        let target = self.disks.get(archive_disk).map_err(BuildError::Disk)?;
        tracing::info!(%source_disk, %archive_disk, count = documents.len(), "Documents collected");

        let now = Utc::now();
        let result_filename = keys::archive_filename(now);
        let result_path = keys::archive_key(&self.config.archive_prefix, now);

        // The scratch file is deleted when `scratch` drops, on every path out of here.
        let mut scratch = tempfile::Builder::new();
        scratch.prefix("queuework_").suffix(".zip");
        let scratch = match self.config.scratch_dir {
            Some(ref dir) => scratch.tempfile_in(dir),
            None => scratch.tempfile(),
        }
        .map_err(BuildError::Scratch)?;
        let handle = scratch.reopen().map_err(BuildError::Scratch)?;
        let mut zip = ZipWriter::new(handle);

        let total = documents.len();
        let mut names = EntryNames::default();
        let mut processed = 0usize;

        for document in &documents {
            let spool = match self
                .spool(source.as_ref(), source_disk, &document.path)
                .await
            {
                Ok(spool) => spool,
                Err(SpoolError::Scratch(e)) => return Err(BuildError::Scratch(e)),
                Err(e) => {
                    tracing::warn!(
                        document_id = document.id,
                        path = %document.path,
                        error = %e,
                        "Skipping document"
                    );
                    continue;
                }
            };

            let name = names.claim(&document.entry_name(), document.id);
            let (writer, written) =
                write_entry_blocking(zip, name.clone(), zip_timestamp(document.updated_at), spool)
                    .await?;
            zip = writer;
            let size = written?;

            processed += 1;
            let progress = archive_progress(processed, total);
            if let Err(e) = self.archive_jobs.update_progress(job.id, progress).await {
                tracing::warn!(error = %e, "Failed to persist archive progress");
            }
            tracing::debug!(
                document_id = document.id,
                entry = %name,
                size,
                progress,
                "Added file to archive"
            );
        }

        tokio::task::spawn_blocking(move || finish_archive(zip))
            .await
            .map_err(|e| BuildError::Writer(e.to_string()))??;

        let options = UploadOptions::attachment(&result_filename, ARCHIVE_MIME_TYPE);
        let uploaded = target
            .upload_file(&result_path, scratch.path(), &options)
            .await
            .map_err(BuildError::Upload)?;
        tracing::info!(%result_path, bytes = uploaded, "Archive uploaded");

        Ok(BuiltArchive {
            result_path,
            result_filename,
            entries: processed,
            skipped: total - processed,
        })
    }

    /// The job's documents in `document_ids` order. Ids that no longer resolve
    /// are dropped.
    async fn load_documents(&self, job: &ArchiveJob) -> Result<Vec<Document>, BuildError> {
        let found = self
            .documents
            .get_many(&job.document_ids)
            .await
            .map_err(BuildError::Documents)?;
        let mut by_id: HashMap<i64, Document> = found.into_iter().map(|d| (d.id, d)).collect();

        let mut ordered = Vec::with_capacity(by_id.len());
        for id in &job.document_ids {
            match by_id.remove(id) {
                Some(document) => ordered.push(document),
                None => tracing::warn!(document_id = id, "Document no longer exists"),
            }
        }
        Ok(ordered)
    }

    /// Copies a blob into an anonymous temp file, positioned at its start.
    ///
    /// Remote disks are read in sequential ranges; local disks are streamed.
    async fn spool(
        &self,
        storage: &dyn Storage,
        disk: StorageBackend,
        key: &str,
    ) -> Result<File, SpoolError> {
        let file = match self.config.scratch_dir {
            Some(ref dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut spool = tokio::fs::File::from_std(file);

        if disk.is_remote() {
            let size = storage.content_length(key).await?;
            let chunk = self.config.range_chunk_bytes.max(1);
            let mut offset = 0u64;
            while offset < size {
                let end = (offset + chunk - 1).min(size - 1);
                let bytes = storage.download_range(key, offset, end).await?;
                if bytes.is_empty() {
                    return Err(SpoolError::EmptyRange {
                        key: key.to_string(),
                        start: offset,
                        end,
                    });
                }
                spool.write_all(&bytes).await?;
                offset += bytes.len() as u64;
            }
        } else {
            let mut stream = storage.download_stream(key).await?;
            while let Some(piece) = stream.next().await {
                spool.write_all(&piece?).await?;
            }
        }

        spool.flush().await?;
        let mut file = spool.into_std().await;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }
}

/// Runs [`write_entry`] on the blocking pool. The writer comes back alongside
/// the entry result; only a lost blocking task loses it.
async fn write_entry_blocking(
    mut zip: ZipWriter<File>,
    name: String,
    modified: Option<zip::DateTime>,
    mut spool: File,
) -> Result<(ZipWriter<File>, Result<u64, BuildError>), BuildError> {
    tokio::task::spawn_blocking(move || {
        let written = write_entry(&mut zip, &name, modified, &mut spool);
        (zip, written)
    })
    .await
    .map_err(|e| BuildError::Writer(e.to_string()))
}

fn finish_archive(mut zip: ZipWriter<File>) -> Result<(), BuildError> {
    let mut handle = zip
        .finish()
        .map_err(|e| BuildError::Finalize(e.to_string()))?;
    handle
        .flush()
        .and_then(|_| handle.sync_all())
        .map_err(|e| BuildError::Finalize(e.to_string()))
}

fn write_entry(
    zip: &mut ZipWriter<File>,
    name: &str,
    modified: Option<zip::DateTime>,
    spool: &mut File,
) -> Result<u64, BuildError> {
    let write_error = |reason: String| BuildError::Write {
        name: name.to_string(),
        reason,
    };

    let len = spool
        .metadata()
        .map_err(|e| write_error(e.to_string()))?
        .len();
    let mut options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644)
        .large_file(len > ZIP32_LIMIT);
    if let Some(modified) = modified {
        options = options.last_modified_time(modified);
    }

    zip.start_file(name, options)
        .map_err(|e| write_error(e.to_string()))?;
    std::io::copy(spool, zip).map_err(|e| write_error(e.to_string()))
}

fn zip_timestamp(at: DateTime<Utc>) -> Option<zip::DateTime> {
    zip::DateTime::from_date_and_time(
        u16::try_from(at.year()).ok()?,
        at.month() as u8,
        at.day() as u8,
        at.hour() as u8,
        at.minute() as u8,
        at.second() as u8,
    )
    .ok()
}

/// Strips any directory part so entries cannot escape the extraction root.
fn sanitize_entry_name(name: &str, fallback: &str) -> String {
    let base = keys::file_basename(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        fallback.to_string()
    } else {
        base.chars()
            .map(|c| if c.is_control() { '_' } else { c })
            .collect()
    }
}

/// Entry names already used in one archive.
#[derive(Default)]
struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    /// A unique name for this entry; repeats become `name (1).ext`, `name (2).ext`.
    fn claim(&mut self, wanted: &str, document_id: i64) -> String {
        let wanted = sanitize_entry_name(wanted, &format!("document_{}", document_id));
        if self.taken.insert(wanted.clone()) {
            return wanted;
        }

        let (stem, extension) = match wanted.rfind('.') {
            Some(idx) if idx > 0 => (&wanted[..idx], Some(&wanted[idx + 1..])),
            _ => (wanted.as_str(), None),
        };
        let mut n = 0u32;
        loop {
            n += 1;
            let candidate = match extension {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

/// Lock key guarding builds of one job.
pub fn lock_key(job_id: Uuid) -> String {
    format!("{}:{}", queuework_core::constants::ARCHIVE_LOCK_PREFIX, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_get_counters() {
        let mut names = EntryNames::default();
        assert_eq!(names.claim("report.pdf", 1), "report.pdf");
        assert_eq!(names.claim("report.pdf", 2), "report (1).pdf");
        assert_eq!(names.claim("report.pdf", 3), "report (2).pdf");
        assert_eq!(names.claim("README", 4), "README");
        assert_eq!(names.claim("README", 5), "README (1)");
        assert_eq!(names.claim(".env", 6), ".env");
        assert_eq!(names.claim(".env", 7), ".env (1)");
    }

    #[test]
    fn names_are_reduced_to_basenames() {
        let mut names = EntryNames::default();
        assert_eq!(names.claim("../../etc/passwd", 1), "passwd");
        assert_eq!(names.claim("dir\\evil.txt", 2), "evil.txt");
        assert_eq!(names.claim("..", 3), "document_3");
        assert_eq!(names.claim("", 4), "document_4");
    }

    #[test]
    fn lock_keys_are_namespaced() {
        assert_eq!(
            lock_key(Uuid::nil()),
            "archive-job:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn timestamps_outside_dos_range_are_dropped() {
        use chrono::TimeZone;
        assert!(zip_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()).is_some());
        assert!(zip_timestamp(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()).is_none());
    }

    #[test]
    fn entries_are_stored_uncompressed() {
        let mut zip = ZipWriter::new(tempfile::tempfile().unwrap());
        let mut spool = tempfile::tempfile().unwrap();
        spool.write_all(b"stored bytes").unwrap();
        spool.seek(SeekFrom::Start(0)).unwrap();

        let written = write_entry(&mut zip, "a.txt", None, &mut spool).unwrap();
        assert_eq!(written, 12);

        let mut file = zip.finish().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "a.txt");
        assert_eq!(entry.compression(), CompressionMethod::Stored);
        assert_eq!(entry.size(), 12);
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(BuildError::Upload(StorageError::UploadFailed("reset".into())).is_retryable());
        assert!(!BuildError::Upload(StorageError::ConfigError("no disk".into())).is_retryable());
        assert!(!BuildError::NoDocuments.is_retryable());
        assert!(!BuildError::Finalize("bad".into()).is_retryable());
        assert!(!BuildError::Scratch(std::io::Error::other("disk full")).is_retryable());
    }
}
