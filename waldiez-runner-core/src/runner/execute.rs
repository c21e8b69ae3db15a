//! Child process execution: spawn, supervise, classify.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};
use waldiez_runner_model::{TaskResponse, TaskResults, TaskStatus};

use crate::context::AppContext;
use crate::error::Result;
use crate::runner::env::{venv_python, Scratch};
use crate::watcher::watch_status_and_cancel_if_needed;

/// SIGTERM → SIGKILL escalation window.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Windows termination codes (Ctrl+C / taskkill). One number, two
/// spellings.
const WINDOWS_CTRL_C: i64 = 0xC000013A;

/// Spawn the child in its own process group, run the status watcher beside
/// it, and wait for exit, watcher-initiated termination, or the duration
/// cap. Returns the Python-style exit code (negative = killed by signal).
pub async fn run_app_in_venv(
    ctx: &AppContext,
    task: &TaskResponse,
    scratch: &Scratch,
    env_vars: &std::collections::BTreeMap<String, String>,
) -> Result<i64> {
    let python = venv_python(&scratch.venv_dir);
    let mut cmd = Command::new(python);
    cmd.arg("-m")
        .arg("main")
        .arg("--task-id")
        .arg(&task.id)
        .arg("--redis-url")
        .arg(ctx.redis.url())
        .arg("--input-timeout")
        .arg(task.input_timeout.to_string());
    if ctx.config.debug {
        cmd.arg("--debug");
    }
    cmd.arg(&scratch.file_path)
        .current_dir(&scratch.app_dir)
        .envs(env_vars)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let watcher = tokio::spawn(watch_status_and_cancel_if_needed(
        ctx.tasks(),
        ctx.redis.clone(),
        task.id.clone(),
        pid,
    ));

    let wait = child.wait();
    tokio::pin!(wait);
    let mut exit_code = tokio::select! {
        status = &mut wait => python_exit_code(&status?),
        _ = tokio::time::sleep(ctx.config.max_task_duration) => {
            warn!(
                "task {} exceeded the {}s duration cap",
                task.id,
                ctx.config.max_task_duration.as_secs()
            );
            if let Some(pid) = pid {
                terminate_process_group(pid, TERMINATION_GRACE).await;
            }
            python_exit_code(&wait.await?)
        }
    };

    if watcher.is_finished() {
        match watcher.await {
            Ok(Ok(Some(hint))) => {
                info!("watcher terminated task {}, exit hint {hint}", task.id);
                exit_code = hint;
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("watcher for task {} errored: {e}", task.id),
            Err(e) => warn!("watcher for task {} panicked: {e}", task.id),
        }
    } else {
        watcher.abort();
    }

    info!("task {} exited with code {exit_code}", task.id);
    Ok(exit_code)
}

/// Collapse an [`std::process::ExitStatus`] into one integer the way
/// Python's `Process.wait` does: `-N` for death by signal N.
pub fn python_exit_code(status: &std::process::ExitStatus) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -(signal as i64);
        }
    }
    status.code().map(i64::from).unwrap_or(-1)
}

/// Total exit-code classification: every integer maps to a terminal status.
pub fn interpret_exit_code(
    exit_code: i64,
) -> (TaskStatus, Option<TaskResults>) {
    if exit_code == 0 {
        return (TaskStatus::Completed, None);
    }
    if exit_code == -15 {
        return (
            TaskStatus::Cancelled,
            Some(TaskResults::error("Task was terminated by signal")),
        );
    }
    if exit_code < 0 {
        return (
            TaskStatus::Cancelled,
            Some(TaskResults::error(format!(
                "Terminated by signal {}",
                -exit_code
            ))),
        );
    }
    if exit_code == WINDOWS_CTRL_C {
        return (
            TaskStatus::Cancelled,
            Some(TaskResults::error(
                "Cancelled via Ctrl+C or task kill (Windows)",
            )),
        );
    }
    (
        TaskStatus::Failed,
        Some(TaskResults::error(format!(
            "Task failed with exit code {exit_code}"
        ))),
    )
}

/// SIGTERM the whole process group, give it [`TERMINATION_GRACE`] (or the
/// provided window) to die, then SIGKILL whatever is left.
pub async fn terminate_process_group(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(pid as i32);
        if killpg(pgid, Signal::SIGTERM).is_err() {
            // Group already gone.
            return;
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if kill(Pid::from_raw(pid as i32), None).is_err() {
                return;
            }
        }
        warn!("process group {pid} survived SIGTERM, sending SIGKILL");
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}
