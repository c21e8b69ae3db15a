//! Job dispatch: from an admitted payload to a queued job, plus the
//! cancellation entry point.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};
use waldiez_runner_model::{
    Task, TaskCreate, TaskResponse, TaskResults, TaskStatus,
};

use crate::broker::Job;
use crate::context::AppContext;
use crate::error::{Result, RunnerError};
use crate::redis::io_stream::TaskIoStream;
use crate::storage::Storage as _;

const ENQUEUE_RETRIES: u32 = 3;
const ENQUEUE_BACKOFF_BASE_SECS: u64 = 2;

/// Create the task row, move the payload into its final location and hand
/// the job to the broker. Every failure unwinds what came before it.
pub async fn create_and_dispatch(
    ctx: &AppContext,
    task_create: TaskCreate,
    saved_path: &str,
    env_vars: BTreeMap<String, String>,
) -> Result<Task> {
    let repo = ctx.tasks();
    let task = repo.create(task_create).await?;

    let destination =
        format!("{}/{}/{}", task.client_id, task.id, task.filename);
    if let Err(e) = ctx.storage.move_file(saved_path, &destination).await {
        error!("failed to place payload for task {}: {e}", task.id);
        let _ = ctx.storage.delete_file(saved_path).await;
        let _ = repo.delete(&task.id).await;
        return Err(e);
    }

    if let Err(e) = trigger(ctx, TaskResponse::from(task.clone()), env_vars)
        .await
    {
        error!("failed to enqueue task {}: {e}", task.id);
        let _ = ctx
            .storage
            .delete_folder(&format!("{}/{}", task.client_id, task.id))
            .await;
        let _ = repo.delete(&task.id).await;
        return Err(RunnerError::Broker(e.to_string()));
    }
    let task = repo.get(&task.id).await?.ok_or_else(|| {
        RunnerError::internal("task vanished while dispatching")
    })?;
    info!("task {} dispatched", task.id);
    Ok(task)
}

/// The boundary call the HTTP layer makes: enqueue `{task, env_vars}` on
/// the configured queue. At-least-once with bounded retries; consumers are
/// idempotent.
pub async fn trigger(
    ctx: &AppContext,
    task: TaskResponse,
    env_vars: BTreeMap<String, String>,
) -> Result<()> {
    let task_id = task.id.clone();
    let job = Job { task, env_vars };
    let mut attempt = 0;
    loop {
        match ctx.queue.enqueue(job.clone()).await {
            Ok(()) => break,
            Err(e) => {
                attempt += 1;
                if attempt >= ENQUEUE_RETRIES {
                    return Err(e);
                }
                let wait = ENQUEUE_BACKOFF_BASE_SECS.pow(attempt);
                warn!(
                    "enqueue of task {task_id} failed: {e}; \
                     retrying ({attempt}/{ENQUEUE_RETRIES}) in {wait}s"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }
    }
    ctx.tasks().mark_triggered(&task_id).await?;
    Ok(())
}

/// Cancel an active task: record CANCELLED synchronously, then publish on
/// the status channel so the watcher signals the child.
pub async fn cancel(ctx: &AppContext, task: &Task) -> Result<Task> {
    if task.is_inactive() {
        return Err(RunnerError::InvalidState(format!(
            "Cannot cancel task with status {}",
            task.status
        )));
    }
    let repo = ctx.tasks();
    repo.update_status(
        &task.id,
        TaskStatus::Cancelled,
        None,
        Some(&TaskResults::error("Task cancelled")),
        false,
    )
    .await?;

    let io = TaskIoStream::new(&task.id, ctx.redis.connection().await?);
    io.publish_status(TaskStatus::Cancelled, Some(cancellation_data()))
        .await?;

    repo.get(&task.id)
        .await?
        .ok_or_else(|| RunnerError::NotFound("Task".to_string()))
}

/// Data payload of the cancellation announcement. The capital-C wire
/// casing is load-bearing: subscribers and the recorded `results` row
/// ("Task cancelled") are distinct strings.
fn cancellation_data() -> serde_json::Value {
    json!({"detail": "Task Cancelled"})
}

/// Remove a task's row and storage folder. Used by the delete endpoints
/// and the maintenance sweeper.
pub async fn delete_task_data(
    ctx: &AppContext,
    task_id: &str,
    client_id: &str,
) -> Result<()> {
    if let Err(e) = ctx.tasks().delete(task_id).await {
        error!("error deleting task {task_id}: {e}");
    }
    if let Err(e) = ctx
        .storage
        .delete_folder(&format!("{client_id}/{task_id}"))
        .await
    {
        error!("error deleting task storage for {task_id}: {e}");
    }
    Ok(())
}
