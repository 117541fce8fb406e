//! Failure classification for queued tasks.
//!
//! The queue redelivers a failed task until its attempts run out. A handler
//! that knows another attempt cannot help (the job row is gone, the build timed
//! out, the archive could not be written) returns an unrecoverable
//! [`TaskError`] and the task fails on the spot.

use std::fmt;

#[derive(Debug)]
pub struct TaskError {
    source: anyhow::Error,
    recoverable: bool,
}

impl TaskError {
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            source: err.into(),
            recoverable: false,
        }
    }

    /// Redelivered while attempts remain.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            source: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

/// Marks the error side of a result as unrecoverable.
pub trait TaskResultExt<T> {
    fn unrecoverable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, TaskError> {
        self.map_err(TaskError::unrecoverable)
    }
}
