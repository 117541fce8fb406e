//! Application state shared by every handler and the task worker.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use queuework_core::models::{Task, TaskType};
use queuework_core::Config;
use queuework_db::Repositories;
use queuework_services::{ArchiveService, ArchiveTaskHandler, ChunkedUploadManager, DiskRegistry};
use queuework_worker::TaskHandlerContext;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repos: Repositories,
    pub disks: DiskRegistry,
    pub uploads: Arc<ChunkedUploadManager>,
    pub archives: Arc<ArchiveService>,
    pub archive_handler: Arc<ArchiveTaskHandler>,
}

#[async_trait]
impl TaskHandlerContext for AppState {
    async fn dispatch_task(self: Arc<Self>, task: &Task) -> Result<serde_json::Value> {
        match task.task_type {
            TaskType::BuildArchive => self.archive_handler.process(task).await,
        }
    }
}

fn _assert_app_state_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<AppState>();
    assert_sync::<AppState>();
}
