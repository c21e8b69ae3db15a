//! The task runner: a pool of workers consuming jobs from the queue, each
//! supervising one child process from scratch staging to archived results.

pub mod env;
pub mod execute;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use waldiez_runner_model::{TaskResponse, TaskResults, TaskStatus};

use crate::broker::Job;
use crate::context::AppContext;
use crate::error::Result;
use crate::storage::Storage as _;

use env::{prepare_app_env, Scratch};
use execute::{interpret_exit_code, run_app_in_venv};

const DEQUEUE_WAIT: Duration = Duration::from_secs(2);

/// Worker pool; width = `max_jobs`. Mirrors one job per worker at a time,
/// each with its own child process and watcher.
#[derive(Debug)]
pub struct RunnerPool {
    workers: Vec<Worker>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RunnerPool {
    pub fn start(ctx: Arc<AppContext>) -> Self {
        let count = ctx.config.max_jobs.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let ctx = ctx.clone();
            let handle =
                tokio::spawn(
                    async move { worker_loop(id, ctx, shutdown_rx).await },
                );
            workers.push(Worker {
                id,
                handle,
                shutdown_tx,
            });
        }
        info!("started {count} task runners");
        Self { workers }
    }

    /// Stop accepting jobs and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.shutdown_tx.send(()).await;
        }
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                warn!("runner {} did not shut down cleanly: {e}", worker.id);
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    ctx: Arc<AppContext>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    info!("runner {id} started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("runner {id} shutting down");
                break;
            }
            job = ctx.queue.dequeue(DEQUEUE_WAIT) => match job {
                Ok(Some(job)) => {
                    let task_id = job.task.id.clone();
                    info!("runner {id} picked up task {task_id}");
                    run_job(&ctx, job).await;
                    info!("runner {id} finished task {task_id}");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("runner {id} queue error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Execute one job end to end. Never propagates to the queue: every
/// failure mode lands in the task row instead.
pub async fn run_job(ctx: &AppContext, job: Job) {
    let Job { task, env_vars } = job;
    let repo = ctx.tasks();

    let scratch = match Scratch::create(&task) {
        Ok(scratch) => scratch,
        Err(e) => {
            error!("failed to stage task {}: {e}", task.id);
            let _ = repo
                .update_status(
                    &task.id,
                    TaskStatus::Failed,
                    None,
                    Some(&TaskResults::error(e.to_string())),
                    false,
                )
                .await;
            return;
        }
    };

    if let Err(e) = prepare_app_env(
        ctx.storage.as_ref(),
        &task,
        &scratch,
        ctx.config.skip_deps,
    )
    .await
    {
        error!("failed to prepare the app env for task {}: {e}", task.id);
        let _ = repo
            .update_status(
                &task.id,
                TaskStatus::Failed,
                None,
                Some(&TaskResults::error(e.to_string())),
                false,
            )
            .await;
        scratch.cleanup();
        return;
    }

    let (status, results) =
        match run_app_in_venv(ctx, &task, &scratch, &env_vars).await {
            Ok(exit_code) => interpret_exit_code(exit_code),
            Err(e) => {
                error!("task {} failed unexpectedly: {e}", task.id);
                (
                    TaskStatus::Failed,
                    Some(TaskResults::error(e.to_string())),
                )
            }
        };
    info!("task {} finished with status {status}", task.id);

    // The watcher's write usually lands first; the terminal guard makes
    // this one a no-op in that case. A SIGTERM exit keeps whatever results
    // were already recorded.
    let skip_results = status == TaskStatus::Cancelled && results.is_none();
    if let Err(e) = repo
        .update_status(
            &task.id,
            status,
            None,
            results.as_ref(),
            skip_results,
        )
        .await
    {
        error!("failed to record final status for task {}: {e}", task.id);
    }

    if ctx.config.keep_tasks_for_days > 0 {
        if let Err(e) = copy_results_to_storage(ctx, &task, &scratch).await {
            error!("failed to archive task {} outputs: {e}", task.id);
        }
    }
    scratch.cleanup();
}

/// Copy `app/waldiez_out/` into the task's storage folder and scrub any
/// `.env` that leaked along.
async fn copy_results_to_storage(
    ctx: &AppContext,
    task: &TaskResponse,
    scratch: &Scratch,
) -> Result<()> {
    let results_dir = scratch.app_dir.join("waldiez_out");
    if !results_dir.is_dir() {
        warn!("no results directory found for task {}", task.id);
        return Ok(());
    }
    let destination =
        format!("{}/{}/waldiez_out", task.client_id, task.id);
    ctx.storage
        .copy_folder(&results_dir.to_string_lossy(), &destination)
        .await?;
    for leaked in [
        format!("{}/{}/waldiez_out/.env", task.client_id, task.id),
        format!("{}/{}/app/.env", task.client_id, task.id),
    ] {
        if ctx.storage.is_file(&leaked).await {
            ctx.storage.delete_file(&leaked).await?;
        }
    }
    Ok(())
}
