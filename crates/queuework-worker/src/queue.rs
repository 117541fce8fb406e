//! Task queue: worker pool, polling, retry, and submission.
//!
//! Shutdown: [`TaskQueue::shutdown`] signals the pool to stop claiming; in-flight
//! tasks keep running. [`TaskQueue::drain`] waits for them up to a deadline.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use queuework_core::models::{Task, TaskPayload, TaskType};
use queuework_core::{Config, TaskError};
use queuework_db::TaskRepository;

use crate::context::TaskHandlerContext;

/// Maximum delay in seconds before retrying a failed task. Caps exponential backoff
/// so that high attempt counts do not produce excessively long delays.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Timeout applied to tasks created without one.
const FALLBACK_TIMEOUT_SECS: u64 = 3600;

/// Computes backoff in seconds for a given attempt count (exponential with cap).
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempts: i32) -> u64 {
    2_u64
        .checked_pow(attempts.max(0) as u32)
        .unwrap_or(u64::MAX)
        .min(MAX_RETRY_BACKOFF_SECS)
}

#[derive(Clone, Debug)]
pub struct TaskQueueConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_seconds: i32,
    /// Deliveries per task, including the first.
    pub max_attempts: i32,
    /// Interval in seconds between runs of the stale task reaper.
    pub stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to task timeout before reaping stale running tasks.
    pub stale_task_grace_period_secs: i64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_ms: 1000,
            default_timeout_seconds: 3600,
            max_attempts: 3,
            stale_task_reap_interval_secs: 60,
            stale_task_grace_period_secs: 300,
        }
    }
}

impl From<&Config> for TaskQueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.task_queue_max_workers(),
            poll_interval_ms: config.task_queue_poll_interval_ms(),
            default_timeout_seconds: config.archive_job_timeout_seconds() as i32,
            max_attempts: config.task_queue_max_attempts(),
            stale_task_reap_interval_secs: config.stale_job_reap_interval_secs(),
            stale_task_grace_period_secs: config.stale_task_grace_period_secs(),
        }
    }
}

pub struct TaskQueue {
    repository: Arc<dyn TaskRepository>,
    config: TaskQueueConfig,
    semaphore: Arc<Semaphore>,
    shutdown_tx: mpsc::Sender<()>,
}

impl TaskQueue {
    /// Create a new TaskQueue and spawn its worker pool, dispatching through a
    /// weak reference to the handler context.
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        config: TaskQueueConfig,
        context: Weak<dyn TaskHandlerContext>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));

        let repo_clone = repository.clone();
        let config_clone = config.clone();
        let semaphore_clone = semaphore.clone();

        tokio::spawn(async move {
            Self::worker_pool(
                repo_clone,
                config_clone,
                semaphore_clone,
                context,
                shutdown_rx,
            )
            .await;
        });

        Self {
            repository,
            config,
            semaphore,
            shutdown_tx,
        }
    }

    /// Creates a TaskQueue that does not spawn a worker.
    /// Tasks submitted here are written to the store and picked up by a real worker.
    pub fn new_no_worker(repository: Arc<dyn TaskRepository>, config: TaskQueueConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        drop(shutdown_rx);
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            repository,
            config,
            semaphore,
            shutdown_tx,
        }
    }

    /// Submit a new task to the queue.
    #[tracing::instrument(skip(self, payload))]
    pub async fn submit_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
        timeout_seconds: Option<i32>,
    ) -> Result<Uuid> {
        let task = self
            .repository
            .create_task(
                task_type,
                payload,
                scheduled_at,
                self.config.max_attempts,
                Some(timeout_seconds.unwrap_or(self.config.default_timeout_seconds)),
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    task_type = %task_type,
                    "Failed to create task in repository"
                );
                anyhow::anyhow!("Failed to create task in repository: {}", e)
            })?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task_type,
            "Task submitted to queue"
        );

        Ok(task.id)
    }

    /// Submit a typed payload.
    pub async fn submit<P: TaskPayload>(
        &self,
        payload: &P,
        timeout_seconds: Option<i32>,
    ) -> Result<Uuid> {
        self.submit_task(P::task_type(), Task::payload_from(payload), None, timeout_seconds)
            .await
    }

    async fn worker_pool(
        repository: Arc<dyn TaskRepository>,
        config: TaskQueueConfig,
        semaphore: Arc<Semaphore>,
        context: Weak<dyn TaskHandlerContext>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_workers = config.max_workers,
            poll_interval_ms = config.poll_interval_ms,
            "Task queue worker pool started"
        );

        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        // Spawn stale task reaper (if interval > 0)
        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if config.stale_task_reap_interval_secs > 0 {
            let repo_for_reaper = repository.clone();
            let reap_interval = Duration::from_secs(config.stale_task_reap_interval_secs);
            let grace_period = config.stale_task_grace_period_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = repo_for_reaper.reap_stale_running_tasks(grace_period).await {
                                tracing::error!(error = %e, "Stale task reaper failed");
                            }
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Task queue worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    break;
                }
                _ = sleep(poll_interval) => {
                    // Claim until the pool is full or the queue is empty.
                    for _ in 0..config.max_workers.max(1) {
                        if !Self::claim_and_dispatch_one(&repository, &semaphore, &context).await {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Task queue worker pool stopped");
    }

    /// Returns true when a task was claimed and dispatched.
    async fn claim_and_dispatch_one(
        repository: &Arc<dyn TaskRepository>,
        semaphore: &Arc<Semaphore>,
        context: &Weak<dyn TaskHandlerContext>,
    ) -> bool {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No workers available, skipping claim");
                return false;
            }
        };

        match repository.claim_next_task().await {
            Ok(Some(task)) => {
                let repo = repository.clone();
                let ctx = context.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = Self::process_task_with_retry(task, repo, ctx).await {
                        tracing::error!(error = %e, "Task processing failed");
                    }
                });
                true
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No tasks available in queue");
                false
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim task from queue");
                false
            }
        }
    }

    #[tracing::instrument(skip(repository, context), fields(task.id = %task.id, task.type = %task.task_type, task.attempts = task.attempts))]
    async fn process_task_with_retry(
        task: Task,
        repository: Arc<dyn TaskRepository>,
        context: Weak<dyn TaskHandlerContext>,
    ) -> Result<()> {
        let Some(ctx) = context.upgrade() else {
            repository
                .reschedule(
                    task.id,
                    Utc::now() + chrono::Duration::seconds(1),
                    json!({ "error": "No handler context available" }),
                )
                .await
                .context("Failed to reschedule task")?;
            return Err(anyhow::anyhow!(
                "TaskHandlerContext was dropped, cannot process task"
            ));
        };

        let timeout_duration = task
            .timeout_seconds
            .map(|s| Duration::from_secs(s.max(1) as u64))
            .unwrap_or(Duration::from_secs(FALLBACK_TIMEOUT_SECS));

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout_duration, ctx.dispatch_task(&task)).await;

        match result {
            Ok(Ok(task_result)) => {
                repository
                    .mark_completed(task.id, task_result)
                    .await
                    .context("Failed to mark task as completed")?;
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Task completed successfully"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let is_unrecoverable = e
                    .downcast_ref::<TaskError>()
                    .map(|te| !te.is_recoverable())
                    .unwrap_or(false);

                tracing::error!(
                    task_id = %task.id,
                    error = %e,
                    attempts = task.attempts,
                    max_attempts = task.max_attempts,
                    unrecoverable = is_unrecoverable,
                    "Task execution failed"
                );

                if is_unrecoverable {
                    let error_result = json!({
                        "error": e.to_string(),
                        "attempts": task.attempts,
                        "unrecoverable": true,
                    });
                    repository
                        .mark_failed(task.id, error_result)
                        .await
                        .context("Failed to mark task as failed")?;
                    tracing::error!(
                        task_id = %task.id,
                        "Task failed with unrecoverable error, will not retry"
                    );
                    return Err(e);
                }

                Self::retry_or_fail(&task, repository.as_ref(), e.to_string()).await
            }
            Err(_) => {
                tracing::error!(
                    task_id = %task.id,
                    timeout_seconds = ?task.timeout_seconds,
                    "Task execution timed out"
                );
                Self::retry_or_fail(
                    &task,
                    repository.as_ref(),
                    "Task execution timed out".to_string(),
                )
                .await
            }
        }
    }

    async fn retry_or_fail(task: &Task, repository: &dyn TaskRepository, error: String) -> Result<()> {
        if task.can_retry() {
            let backoff_seconds = compute_retry_backoff_seconds(task.attempts);
            tracing::info!(
                task_id = %task.id,
                next_attempt = task.attempts + 1,
                backoff_seconds = backoff_seconds,
                "Scheduling task retry"
            );
            let at = Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
            repository
                .reschedule(task.id, at, json!({ "error": error, "attempts": task.attempts }))
                .await
                .context("Failed to reschedule task")?;
            Ok(())
        } else {
            let error_result = json!({
                "error": error,
                "attempts": task.attempts,
                "reason": "Task failed after maximum attempts"
            });
            repository
                .mark_failed(task.id, error_result)
                .await
                .context("Failed to mark task as failed")?;
            tracing::error!(task_id = %task.id, "Task failed after max attempts");
            Err(anyhow::anyhow!(error))
        }
    }

    /// Signals the worker pool to stop claiming new tasks and exit the main loop.
    ///
    /// Returns immediately; already-spawned task handlers continue running until
    /// they complete or time out. Use [`TaskQueue::drain`] to wait for them.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating task queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Waits until no task is in flight, up to `timeout`. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let workers = self.config.max_workers.max(1) as u32;
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(workers)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Task queue drain timed out with tasks in flight"
                );
                false
            }
        }
    }
}

impl Clone for TaskQueue {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}
