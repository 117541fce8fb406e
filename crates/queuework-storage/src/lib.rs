//! Queuework Storage Library
//!
//! Storage abstraction over the disks documents and archives live on. A disk
//! is either a remote object store (S3 and compatibles) or a local directory;
//! the [`DiskRegistry`] maps disk names recorded on documents and jobs to the
//! backend configured for them.
//!
//! # Storage key format
//!
//! - chunk blobs: `temp-uploads/{session_id}/chunk_{index}`
//! - documents: `{folder}/{uuid}_{filename}`
//! - archives: `{prefix}/{YYYY}/{mm}/{dd}/{uuid}.zip`
//!
//! Keys must not contain `..` or a leading `/`. Key generation is centralized in
//! the `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod signing;
pub mod traits;

// Re-export commonly used types
pub use factory::{create_disks, DiskRegistry};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use queuework_core::StorageBackend;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{ByteStream, Storage, StorageError, StorageResult, UploadOptions};
