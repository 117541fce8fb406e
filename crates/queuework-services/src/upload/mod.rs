//! Chunked uploads: session bookkeeping, chunk storage and finalization.

mod manager;
mod mime;

pub use manager::{ChunkedUploadManager, UploadConfig};
pub use mime::detect_mime_type;
