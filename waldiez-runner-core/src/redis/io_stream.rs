//! The per-task Redis I/O fabric.
//!
//! Four topics are derived from a task id:
//!
//! - `task:<id>:output` — append-only stream of workflow output records,
//! - `task:<id>:status` — pub/sub channel for lifecycle transitions,
//! - `task:<id>:input_request` — pub/sub channel carrying input prompts,
//! - `task:<id>:input_response` — pub/sub channel carrying answers.
//!
//! The input-request side of the protocol (prompt publication, answer
//! dedupe) lives in the child shim; this module is the service side:
//! bridge tailing, input response publishing, status publication, and the
//! maintenance sweeps. Consumed request ids land in
//! `task:<id>:processed_requests` (score = unix seconds) and are trimmed
//! here once they age past the retention window.
//!
//! Any child implementation honoring these topics is a valid peer.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::{debug, warn};
use waldiez_runner_model::{InputResponse, TaskStatus};

use crate::error::Result;

/// Default retention for processed-request dedupe entries.
pub const PROCESSED_RETENTION_SECS: i64 = 24 * 60 * 60;
/// Default trim target for task output streams.
pub const OUTPUT_STREAM_MAXLEN: usize = 1000;

pub fn output_stream(task_id: &str) -> String {
    format!("task:{task_id}:output")
}

pub fn status_channel(task_id: &str) -> String {
    format!("task:{task_id}:status")
}

pub fn input_request_channel(task_id: &str) -> String {
    format!("task:{task_id}:input_request")
}

pub fn input_response_channel(task_id: &str) -> String {
    format!("task:{task_id}:input_response")
}

pub fn processed_requests_key(task_id: &str) -> String {
    format!("task:{task_id}:processed_requests")
}

/// One decoded output-stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    /// Stream entry id, the resume cursor for tailing readers.
    pub id: String,
    pub data: Value,
}

/// Service-side handle on one task's topics.
#[derive(Clone)]
pub struct TaskIoStream {
    task_id: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for TaskIoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskIoStream")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl TaskIoStream {
    pub fn new(task_id: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            task_id: task_id.into(),
            conn,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Publish a lifecycle transition on the status channel.
    pub async fn publish_status(
        &self,
        status: TaskStatus,
        data: Option<Value>,
    ) -> Result<()> {
        let payload = encode_status(&self.task_id, status, data);
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(status_channel(&self.task_id), payload)
            .await?;
        Ok(())
    }

    /// Append one output record to the task's stream.
    pub async fn append_output(&self, record: &Value) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(
                output_stream(&self.task_id),
                "*",
                &[("data", record.to_string())],
            )
            .await?;
        Ok(id)
    }

    /// Read output records after `last_id` ("0-0" replays history), blocking
    /// up to `block` for new entries.
    pub async fn read_output_since(
        &self,
        last_id: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<OutputRecord>> {
        let options = StreamReadOptions::default()
            .block(block.as_millis() as usize)
            .count(count);
        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(
                &[output_stream(&self.task_id)],
                &[last_id],
                &options,
            )
            .await?;
        let mut records = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let data = entry
                    .get::<String>("data")
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or(Value::Null);
                records.push(OutputRecord {
                    id: entry.id,
                    data,
                });
            }
        }
        Ok(records)
    }

    /// Relay a client's answer onto the input response channel.
    pub async fn publish_input_response(
        &self,
        response: &InputResponse,
    ) -> Result<()> {
        let payload = serde_json::to_string(response)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(
            input_response_channel(&self.task_id),
            payload,
        )
        .await?;
        Ok(())
    }
}

pub fn encode_status(
    task_id: &str,
    status: TaskStatus,
    data: Option<Value>,
) -> String {
    let mut message = json!({
        "task_id": task_id,
        "status": status.as_str(),
    });
    if let Some(data) = data {
        message["data"] = data;
    }
    message.to_string()
}

/// Drop processed-request entries older than the retention window and
/// delete keys that become empty.
pub async fn cleanup_processed_requests(
    conn: &mut ConnectionManager,
    retention: Duration,
) -> Result<u64> {
    let cutoff = Utc::now().timestamp() - retention.as_secs() as i64;
    let keys: Vec<String> = conn.keys("task:*:processed_requests").await?;
    let mut removed = 0u64;
    for key in keys {
        let trimmed: i64 =
            conn.zrembyscore(&key, "-inf", cutoff).await?;
        removed += trimmed as u64;
        let remaining: i64 = conn.zcard(&key).await?;
        if remaining == 0 {
            conn.del::<_, ()>(&key).await?;
        }
    }
    if removed > 0 {
        debug!("cleaned up {removed} stale processed requests");
    }
    Ok(removed)
}

/// Trim every task output stream to roughly `maxlen` entries, working in
/// batches of `batch` keys.
pub async fn trim_task_output_streams(
    conn: &mut ConnectionManager,
    maxlen: usize,
    batch: usize,
) -> Result<u64> {
    let keys: Vec<String> = conn.keys("task:*:output").await?;
    let mut trimmed = 0u64;
    for chunk in keys.chunks(batch.max(1)) {
        for key in chunk {
            match conn
                .xtrim::<_, i64>(key, StreamMaxlen::Approx(maxlen))
                .await
            {
                Ok(count) => trimmed += count as u64,
                Err(e) => warn!("failed to trim {key}: {e}"),
            }
        }
    }
    Ok(trimmed)
}
