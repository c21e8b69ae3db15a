//! The status watcher: one per running child.
//!
//! Subscribes to `task:<id>:status` on a dedicated connection, mirrors
//! every transition into the repository, and translates CANCELLED into a
//! process-group signal. Pub/sub is not durable: the watcher only observes;
//! the child's exit status stays authoritative for terminal classification.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};
use waldiez_runner_model::StatusMessage;

use crate::db::TaskRepository;
use crate::error::Result;
use crate::redis::io_stream::status_channel;
use crate::redis::RedisManager;
use crate::runner::execute::{terminate_process_group, TERMINATION_GRACE};

/// Poll tick so cancellation of the watcher task itself is observed even
/// when the channel stays silent.
const RECV_TICK: Duration = Duration::from_secs(1);

/// Exit-code hint for a SIGTERM'd child, Python-subprocess style.
const SIGTERM_EXIT_HINT: i64 = -15;

/// Watch one task's status channel until a terminal transition or until the
/// runner aborts us. Returns the exit-code hint (`-SIGTERM`) when this
/// watcher terminated the child, so the runner classifies the exit as
/// CANCELLED.
pub async fn watch_status_and_cancel_if_needed(
    repo: TaskRepository,
    redis: RedisManager,
    task_id: String,
    child_pid: Option<u32>,
) -> Result<Option<i64>> {
    let channel = status_channel(&task_id);
    let mut pubsub = redis.pubsub().await?;
    pubsub.subscribe(&channel).await?;

    let outcome = watch_loop(&repo, &mut pubsub, &task_id, child_pid).await;

    // Release the dedicated connection whatever happened above.
    if let Err(e) = pubsub.unsubscribe(&channel).await {
        debug!("unsubscribe from {channel} failed: {e}");
    }
    outcome
}

async fn watch_loop(
    repo: &TaskRepository,
    pubsub: &mut redis::aio::PubSub,
    task_id: &str,
    child_pid: Option<u32>,
) -> Result<Option<i64>> {
    let mut stream = pubsub.on_message();
    loop {
        let message =
            match tokio::time::timeout(RECV_TICK, stream.next()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(_) => continue,
            };
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("undecodable status payload for {task_id}: {e}");
                continue;
            }
        };
        let Some(parsed) = StatusMessage::decode(&payload) else {
            warn!("ignoring invalid status message for {task_id}");
            continue;
        };
        debug!("task {task_id} status message: {:?}", parsed.status());

        let request_id = match &parsed {
            StatusMessage::WaitingForInput { request_id } => {
                request_id.as_deref()
            }
            _ => None,
        };
        let results = parsed.results();
        if let Err(e) = repo
            .update_status(
                task_id,
                parsed.status(),
                request_id,
                results.as_ref(),
                results.is_none() && !parsed.is_terminal(),
            )
            .await
        {
            warn!("failed to update task {task_id} in DB: {e}");
        }

        if parsed.should_terminate() {
            if let Some(pid) = child_pid {
                info!("terminating task {task_id} child (pid {pid})");
                terminate_process_group(pid, TERMINATION_GRACE).await;
            }
            return Ok(Some(SIGTERM_EXIT_HINT));
        }

        if parsed.is_terminal() {
            return Ok(None);
        }
    }
}
