//! Seam between the worker pool and whoever knows how to run a task.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use queuework_core::models::Task;

/// Implemented by the application state. The pool keeps only a `Weak` to it, so
/// a task claimed after the state is gone is rescheduled instead of run.
#[async_trait]
pub trait TaskHandlerContext: Send + Sync {
    /// Runs `task` and returns the JSON stored as its result.
    ///
    /// Wrap an error in [`queuework_core::TaskError::unrecoverable`] to fail
    /// the task without spending its remaining attempts.
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value>;
}
