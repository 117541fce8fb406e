//! Shared constants for uploads, archive builds and the task queue.

/// Chunk size handed back to clients when a session is opened.
pub const RECOMMENDED_CHUNK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Largest chunk body accepted in a single request.
pub const MAX_CHUNK_SIZE_BYTES: u64 = 64 * 1024 * 1024;

pub const UPLOAD_SESSION_TTL_HOURS: i64 = 24;

pub const MAX_FILENAME_LENGTH: usize = 255;

/// Folder used when the requested one is empty or escapes its root.
pub const DEFAULT_UPLOAD_FOLDER: &str = "uploads";

/// Root under which chunk blobs for open sessions live.
pub const TEMP_UPLOAD_PREFIX: &str = "temp-uploads";

pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

pub const ARCHIVE_MIME_TYPE: &str = "application/zip";

/// Range size used when spooling a remote blob into an archive entry.
pub const ARCHIVE_RANGE_CHUNK_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_ARCHIVE_PREFIX: &str = "queuework/archives";

pub const ARCHIVE_FILENAME_PREFIX: &str = "queuework_";

/// How long a finalize owns its session before another call may take over.
pub const UPLOAD_FINALIZE_LEASE_SECS: i64 = 900;

pub const DEFAULT_ZIP_DOWNLOAD_TTL_MINUTES: u64 = 15;

/// Progress written when a build starts.
pub const ARCHIVE_PROGRESS_STARTED: i16 = 5;

/// Highest progress reported before the archive is uploaded.
pub const ARCHIVE_PROGRESS_CEILING: i16 = 95;

pub const ARCHIVE_PROGRESS_DONE: i16 = 100;

pub const ARCHIVE_JOB_TIMEOUT_SECS: u64 = 1800;

/// Upper bound accepted for `ARCHIVE_JOB_TIMEOUT_SECONDS`.
pub const ARCHIVE_JOB_MAX_TIMEOUT_SECS: u64 = 7200;

pub const ARCHIVE_LOCK_TTL_SECS: u64 = 7200;

pub const ARCHIVE_MAX_ATTEMPTS: i32 = 3;

/// Lock key namespace for archive builds: `archive-job:{id}`.
pub const ARCHIVE_LOCK_PREFIX: &str = "archive-job";

pub const DEFAULT_DOCUMENT_PAGE_SIZE: i64 = 25;

pub const MAX_DOCUMENT_PAGE_SIZE: i64 = 100;
