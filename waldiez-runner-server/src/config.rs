//! Server settings.
//!
//! Every knob is reachable three ways with the usual precedence:
//! CLI flag > `WALDIEZ_RUNNER_*` environment variable > default. A `.env`
//! file is loaded before parsing when present.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use waldiez_runner_core::RunnerConfig;

/// Command line arguments for the Waldiez runner server.
#[derive(Parser, Debug, Clone)]
#[command(name = "waldiez-runner-server")]
#[command(about = "Multi-tenant task execution service for Waldiez workflows")]
pub struct Settings {
    /// Bind host
    #[arg(long, env = "WALDIEZ_RUNNER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(long, env = "WALDIEZ_RUNNER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Concurrent jobs per worker pool and per-client admission cap
    #[arg(long, env = "WALDIEZ_RUNNER_MAX_JOBS", default_value_t = 5)]
    pub max_jobs: usize,

    /// Default input prompt timeout in seconds
    #[arg(long, env = "WALDIEZ_RUNNER_INPUT_TIMEOUT", default_value_t = 180)]
    pub input_timeout: u32,

    /// Hard cap on one task's runtime in seconds
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_MAX_TASK_DURATION",
        default_value_t = 3600
    )]
    pub max_task_duration: u64,

    /// Days to keep task outputs on storage (0 = keep nothing)
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_KEEP_TASKS_FOR_DAYS",
        default_value_t = 0
    )]
    pub keep_tasks_for_days: u32,

    /// Skip venv/pip setup before running tasks
    #[arg(long, env = "WALDIEZ_RUNNER_SKIP_DEPS", default_value_t = false)]
    pub skip_deps: bool,

    /// Database URL (postgres://… or sqlite://…)
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_DB_URL",
        default_value = "sqlite://waldiez_runner.db?mode=rwc"
    )]
    pub db_url: String,

    /// Redis URL
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_REDIS_URL",
        default_value = "redis://127.0.0.1:6379/0"
    )]
    pub redis_url: String,

    /// Use the in-process job queue instead of Redis (smoke mode)
    #[arg(long, env = "WALDIEZ_RUNNER_NO_REDIS", default_value_t = false)]
    pub no_redis: bool,

    /// Storage root for uploaded payloads and task outputs
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_STORAGE_ROOT",
        default_value = "waldiez_storage"
    )]
    pub storage_root: PathBuf,

    /// HS256 secret for token verification
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_SECRET_KEY",
        default_value = "change-me-in-production"
    )]
    pub secret_key: String,

    /// Client id the local-auth token issuer answers to
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_LOCAL_CLIENT_ID",
        default_value = "waldiez-local"
    )]
    pub local_client_id: String,

    /// Secret matching the local client id
    #[arg(
        long,
        env = "WALDIEZ_RUNNER_LOCAL_CLIENT_SECRET",
        default_value = "waldiez-local-secret"
    )]
    pub local_client_secret: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WALDIEZ_RUNNER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Settings {
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            // Values from .env participate as regular env vars below.
        }
        Self::parse()
    }

    pub fn debug(&self) -> bool {
        self.log_level.eq_ignore_ascii_case("debug")
            || self.log_level.eq_ignore_ascii_case("trace")
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_jobs: self.max_jobs,
            input_timeout: self.input_timeout,
            max_task_duration: Duration::from_secs(self.max_task_duration),
            keep_tasks_for_days: self.keep_tasks_for_days,
            skip_deps: self.skip_deps,
            debug: self.debug(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
