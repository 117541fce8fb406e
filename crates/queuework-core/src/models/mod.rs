pub mod archive_job;
pub mod document;
pub mod task;
pub mod upload_session;

pub use archive_job::{
    archive_progress, ArchiveJob, ArchiveJobStatus, ArchiveJobStatusResponse, NewArchiveJob,
};
pub use document::{Document, DocumentListResponse, DocumentResponse, NewDocument};
pub use task::{BuildArchivePayload, Task, TaskPayload, TaskStatus, TaskType};
pub use upload_session::{
    InitUploadRequest, InitUploadResponse, UploadChunkResponse, UploadProgressResponse,
    UploadSession,
};
