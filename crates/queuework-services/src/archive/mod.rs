//! Archive jobs: requests and status, the ZIP builder, and the task handler
//! that runs builds from the queue.

mod builder;
mod handler;
mod service;

pub use builder::{lock_key, ArchiveBuilder, ArchiveBuilderConfig, BuildOutcome};
pub use handler::ArchiveTaskHandler;
pub use service::{ArchiveService, ArchiveServiceConfig};
