//! Durable job queue between the dispatcher and the runner pool.
//!
//! The queue is a capability picked at construction time: Redis list
//! semantics (LPUSH/BRPOP, at-least-once, ordered per producer) in normal
//! deployments, an in-process channel in smoke mode. Consumers are
//! idempotent, so redelivery is tolerable.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use waldiez_runner_model::TaskResponse;

use crate::error::{Result, RunnerError};
use crate::redis::RedisManager;

const QUEUE_KEY: &str = "waldiez:tasks:queue";

/// One unit of work for the runner pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task: TaskResponse,
    pub env_vars: BTreeMap<String, String>,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Wait up to `wait` for the next job. `None` means the wait elapsed —
    /// or, for the in-process queue, that the producer side is gone.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>>;
}

/// Redis-backed queue with list semantics.
#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    manager: RedisManager,
}

impl RedisJobQueue {
    pub fn new(manager: RedisManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.manager.connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, payload).await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>> {
        // BRPOP monopolizes its connection, so each consumer wait runs on a
        // dedicated one rather than the shared publisher pipeline.
        let mut conn = self.manager.dedicated().await?;
        let popped: Option<(String, String)> = conn
            .brpop(QUEUE_KEY, wait.as_secs_f64().max(1.0))
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

/// In-process queue for smoke mode: same contract, no external broker.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| RunnerError::Broker("queue closed".to_string()))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(job) => Ok(job),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waldiez_runner_model::{TaskCreate, TaskResponse};

    fn make_job() -> Job {
        let create = TaskCreate {
            client_id: "c1".to_string(),
            flow_id: "f1".to_string(),
            filename: "flow.waldiez".to_string(),
            input_timeout: 30,
            schedule_type: None,
            scheduled_time: None,
            cron_expression: None,
            expires_at: None,
        };
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        Job {
            task: TaskResponse::from(create.into_task()),
            env_vars: env,
        }
    }

    #[tokio::test]
    async fn in_memory_queue_preserves_order() {
        let queue = InMemoryJobQueue::new();
        let first = make_job();
        let second = make_job();
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let got = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.id, first.task.id);
        let got = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.id, second.task.id);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn jobs_round_trip_through_json() {
        let job = make_job();
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task.id, job.task.id);
        assert_eq!(decoded.env_vars.get("FOO").map(String::as_str), Some("bar"));
    }
}
