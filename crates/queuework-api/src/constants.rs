//! Route prefixes and HTTP limits.

/// Every JSON route lives under this prefix.
pub const API_PREFIX: &str = "/api";

/// Signed local-disk downloads are served here; `LOCAL_STORAGE_BASE_URL` should point at it.
pub const FILES_ROUTE: &str = "/files";

/// Room for multipart framing and the text fields around a chunk body.
pub const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Bounds how long `drain` waits for in-flight archive builds on shutdown.
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;
