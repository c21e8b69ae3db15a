//! Periodic maintenance: the slow housekeeping loop that keeps the task
//! tables, storage folders and Redis keys from growing without bound.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use waldiez_runner_model::{Params, Task, TaskStatus};

use crate::context::AppContext;
use crate::dispatcher::delete_task_data;
use crate::error::Result;
use crate::redis::io_stream::{
    cleanup_processed_requests, trim_task_output_streams,
    OUTPUT_STREAM_MAXLEN, PROCESSED_RETENTION_SECS,
};
use crate::storage::Storage;

/// Soft-deleted tasks are purged after this many days.
pub const OLD_TASKS_ARE_DELETED_AFTER_DAYS: i64 = 30;
/// Inputs nobody answered for this long fail the task.
pub const WAITING_FOR_INPUT_REAP_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub stream_maxlen: usize,
    pub stream_batch: usize,
    pub processed_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stream_maxlen: OUTPUT_STREAM_MAXLEN,
            stream_batch: 100,
            processed_retention: Duration::from_secs(
                PROCESSED_RETENTION_SECS as u64,
            ),
        }
    }
}

/// Background scheduler handle.
#[derive(Debug)]
pub struct Maintenance {
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl Maintenance {
    pub fn start(ctx: Arc<AppContext>, config: MaintenanceConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => run_once(&ctx, &config).await,
                }
            }
            info!("maintenance scheduler stopped");
        });
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

/// One full sweep. Every job is independent; a failure in one never stops
/// the others.
pub async fn run_once(ctx: &AppContext, config: &MaintenanceConfig) {
    heartbeat();
    if let Err(e) = cleanup_old_tasks(ctx).await {
        error!("cleanup_old_tasks failed: {e}");
    }
    if let Err(e) = check_stuck_tasks(ctx).await {
        error!("check_stuck_tasks failed: {e}");
    }
    if let Err(e) = reap_waiting_for_input(ctx).await {
        error!("reap_waiting_for_input failed: {e}");
    }
    match ctx.redis.connection().await {
        Ok(mut conn) => {
            if let Err(e) = cleanup_processed_requests(
                &mut conn,
                config.processed_retention,
            )
            .await
            {
                error!("cleanup_processed_requests failed: {e}");
            }
            if let Err(e) = trim_task_output_streams(
                &mut conn,
                config.stream_maxlen,
                config.stream_batch,
            )
            .await
            {
                error!("trim_old_stream_entries failed: {e}");
            }
        }
        Err(e) => error!("redis maintenance skipped: {e}"),
    }
}

/// Liveness probe; a missing heartbeat line means the scheduler is wedged.
pub fn heartbeat() {
    info!("heartbeat");
}

/// Purge rows and storage folders for tasks tombstoned longer than the
/// retention window.
pub async fn cleanup_old_tasks(ctx: &AppContext) -> Result<u64> {
    let cutoff = Utc::now()
        - ChronoDuration::days(OLD_TASKS_ARE_DELETED_AFTER_DAYS);
    let repo = ctx.tasks();
    let mut deleted = 0u64;
    // Page 1 repeatedly: each pass deletes what it saw.
    for _ in 0..100 {
        let page = repo.list_to_delete(cutoff, Params::new(1, 100)).await?;
        if page.items.is_empty() {
            break;
        }
        for task in &page.items {
            delete_task_data(ctx, &task.id, &task.client_id).await?;
            deleted += 1;
        }
    }
    if deleted > 0 {
        info!("cleaned up {deleted} old tasks");
    }
    Ok(deleted)
}

/// Reconcile tasks stuck with an active status but recorded results.
pub async fn check_stuck_tasks(ctx: &AppContext) -> Result<u64> {
    let repo = ctx.tasks();
    let mut stuck: Vec<Task> = Vec::new();
    let mut page_no = 1;
    while page_no < 50 {
        let page = repo.list_stuck(Params::new(page_no, 100)).await?;
        if page.items.is_empty() {
            break;
        }
        stuck.extend(page.items);
        page_no += 1;
    }
    let reconciled = stuck.len() as u64;
    for task in stuck {
        let status =
            resolve_stuck_status(&task, ctx.storage.as_ref()).await;
        repo.update_status(&task.id, status, None, None, true).await?;
    }
    if reconciled > 0 {
        info!("reconciled {reconciled} stuck tasks");
    }
    Ok(reconciled)
}

/// Results with an error key mean failure; otherwise, files on storage are
/// the evidence of a completed run.
pub async fn resolve_stuck_status(
    task: &Task,
    storage: &dyn Storage,
) -> TaskStatus {
    let Some(results) = &task.results else {
        return TaskStatus::Failed;
    };
    if results.has_error() {
        return TaskStatus::Failed;
    }
    let folder = format!("{}/{}", task.client_id, task.id);
    match storage.list_files(&folder).await {
        Ok(files) if !files.is_empty() => TaskStatus::Completed,
        Ok(_) => TaskStatus::Failed,
        Err(e) => {
            warn!("error checking stuck task {}: {e}", task.id);
            TaskStatus::Failed
        }
    }
}

/// Fail WAITING_FOR_INPUT tasks that have been waiting for more than the
/// reap window.
pub async fn reap_waiting_for_input(ctx: &AppContext) -> Result<u64> {
    let cutoff =
        Utc::now() - ChronoDuration::hours(WAITING_FOR_INPUT_REAP_HOURS);
    let reaped = ctx
        .tasks()
        .update_waiting_for_input_to_failed(cutoff)
        .await?;
    if reaped > 0 {
        info!("reaped {reaped} abandoned input requests");
    }
    Ok(reaped)
}
