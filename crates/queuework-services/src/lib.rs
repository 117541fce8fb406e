//! Queuework Services Layer
//!
//! Business services sitting between the HTTP handlers and the storage and
//! repository crates: the chunked upload workflow, archive requests and status,
//! and the background archive build run by the task queue. Keep coordination
//! here; keep thin HTTP handling in queuework-api.

pub mod archive;
pub mod upload;

pub use archive::{
    lock_key, ArchiveBuilder, ArchiveBuilderConfig, ArchiveService, ArchiveServiceConfig,
    ArchiveTaskHandler, BuildOutcome,
};
pub use queuework_storage::{DiskRegistry, Storage, StorageBackend, StorageError};
pub use upload::{detect_mime_type, ChunkedUploadManager, UploadConfig};
