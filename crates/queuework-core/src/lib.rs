//! Queuework Core Library
//!
//! This crate provides core domain models, error types, configuration, and constants
//! that are shared across all Queuework components.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod storage_types;
pub mod task_error;

// Re-export commonly used types
pub use config::{BaseConfig, Config, QueueworkConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use storage_types::StorageBackend;
pub use task_error::{TaskError, TaskResultExt};
