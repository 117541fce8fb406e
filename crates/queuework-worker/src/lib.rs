//! Background task queue for Queuework.
//!
//! A semaphore-bounded worker pool polls the durable task table, dispatches
//! claimed tasks through a [`TaskHandlerContext`] and applies retry, timeout and
//! stale-task reaping.

pub mod context;
pub mod queue;

pub use context::TaskHandlerContext;
pub use queue::{TaskQueue, TaskQueueConfig, MAX_RETRY_BACKOFF_SECS};
