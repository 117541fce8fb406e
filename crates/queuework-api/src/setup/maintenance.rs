//! Periodic upkeep run next to the HTTP server.
//!
//! - session sweep: drops expired upload sessions and their chunk blobs
//! - stale job recovery: re-queues archive jobs left in `processing` after
//!   their lock lease lapsed

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawns every enabled loop. Each one exits when `shutdown` flips to true.
pub fn spawn_maintenance(
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let sweep_secs = state.config.session_sweep_interval_secs();
    if sweep_secs > 0 {
        let state = state.clone();
        handles.push(spawn_every(
            "session_sweep",
            Duration::from_secs(sweep_secs),
            shutdown.clone(),
            move || {
                let state = state.clone();
                async move {
                    match state.uploads.purge_expired_sessions().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "Expired upload sessions purged"),
                        Err(e) => tracing::warn!(error = %e, "Upload session sweep failed"),
                    }
                }
            },
        ));
    }

    let reap_secs = state.config.stale_job_reap_interval_secs();
    if reap_secs > 0 {
        let stale_after = chrono::Duration::seconds(state.config.archive_lock_ttl_seconds() as i64);
        handles.push(spawn_every(
            "stale_job_recovery",
            Duration::from_secs(reap_secs),
            shutdown,
            move || {
                let state = state.clone();
                async move {
                    match state.archives.recover_stale_jobs(stale_after).await {
                        Ok(0) => {}
                        Ok(requeued) => tracing::info!(requeued, "Stale archive jobs re-queued"),
                        Err(e) => tracing::warn!(error = %e, "Stale archive job recovery failed"),
                    }
                }
            },
        ));
    }

    handles
}

fn spawn_every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut run: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(task = name, period_secs = period.as_secs(), "Maintenance loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => run().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(task = name, "Maintenance loop stopped");
    })
}
