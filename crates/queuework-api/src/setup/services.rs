//! Service wiring

use crate::state::AppState;
use queuework_core::Config;
use queuework_db::Repositories;
use queuework_services::{
    ArchiveBuilder, ArchiveService, ArchiveTaskHandler, ChunkedUploadManager, DiskRegistry,
};
use queuework_worker::{TaskHandlerContext, TaskQueue, TaskQueueConfig};
use std::sync::{Arc, Weak};

/// Builds the application state and starts the archive worker pool against it.
///
/// Archive requests submit through a queue without workers: submission only
/// writes the task row. The returned queue runs the workers and dispatches back
/// into the state through a weak reference.
pub fn initialize_services(
    config: &Config,
    repos: Repositories,
    disks: DiskRegistry,
) -> (Arc<AppState>, TaskQueue) {
    let queue_config = TaskQueueConfig::from(config);
    let submit_queue = TaskQueue::new_no_worker(repos.tasks.clone(), queue_config.clone());

    let uploads = Arc::new(ChunkedUploadManager::new(
        repos.sessions.clone(),
        repos.documents.clone(),
        disks.clone(),
        config.into(),
    ));

    let archives = Arc::new(ArchiveService::new(
        repos.documents.clone(),
        repos.archive_jobs.clone(),
        repos.locks.clone(),
        submit_queue,
        disks.clone(),
        config.into(),
    ));

    let builder = Arc::new(ArchiveBuilder::new(
        repos.documents.clone(),
        repos.archive_jobs.clone(),
        disks.clone(),
        config.into(),
    ));
    let archive_handler = Arc::new(ArchiveTaskHandler::from_config(
        builder,
        repos.archive_jobs.clone(),
        repos.locks.clone(),
        config,
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        repos: repos.clone(),
        disks,
        uploads,
        archives,
        archive_handler,
    });

    let weak: Weak<AppState> = Arc::downgrade(&state);
    let context: Weak<dyn TaskHandlerContext> = weak;
    let worker = TaskQueue::new(repos.tasks.clone(), queue_config, context);
    tracing::info!(
        max_workers = config.task_queue_max_workers(),
        max_attempts = config.task_queue_max_attempts(),
        "Task queue system initialized successfully"
    );

    (state, worker)
}
