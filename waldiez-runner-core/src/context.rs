use std::sync::Arc;
use std::time::Duration;

use crate::broker::JobQueue;
use crate::db::DatabaseManager;
use crate::redis::RedisManager;
use crate::storage::Storage;

/// Knobs the orchestration core needs at runtime. The server layer builds
/// this from its settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker-pool width and the per-client admission cap.
    pub max_jobs: usize,
    /// Default prompt timeout for new tasks, seconds.
    pub input_timeout: u32,
    /// Hard cap on one task's wall-clock runtime.
    pub max_task_duration: Duration,
    /// Days to keep task outputs on storage; `0` keeps nothing.
    pub keep_tasks_for_days: u32,
    /// Skip venv/pip setup (pre-provisioned images).
    pub skip_deps: bool,
    /// Forward `--debug` to child processes.
    pub debug: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 5,
            input_timeout: 180,
            max_task_duration: Duration::from_secs(3600),
            keep_tasks_for_days: 0,
            skip_deps: false,
            debug: false,
        }
    }
}

/// Everything the dispatcher, runner, watcher and maintenance jobs share.
/// Constructed once at startup and passed explicitly; whether the queue is
/// Redis-backed or in-process is decided here and nowhere else.
#[derive(Clone)]
pub struct AppContext {
    pub db: DatabaseManager,
    pub storage: Arc<dyn Storage>,
    pub redis: RedisManager,
    pub queue: Arc<dyn JobQueue>,
    pub config: RunnerConfig,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(
        db: DatabaseManager,
        storage: Arc<dyn Storage>,
        redis: RedisManager,
        queue: Arc<dyn JobQueue>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            db,
            storage,
            redis,
            queue,
            config,
        }
    }

    pub fn tasks(&self) -> crate::db::TaskRepository {
        self.db.tasks()
    }
}
