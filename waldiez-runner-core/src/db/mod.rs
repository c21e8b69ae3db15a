//! Relational persistence over `sqlx::Any`, so the same queries serve
//! SQLite (tests, single-node installs) and PostgreSQL (production).
//!
//! The Any driver only binds scalar types: timestamps persist as RFC3339
//! TEXT (microsecond precision, `Z` suffix, lexicographically ordered) and
//! `results` as JSON TEXT.

pub mod tasks;

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::AnyPool;
use tracing::{info, warn};

use crate::error::{Result, RunnerError};

const CONNECT_RETRIES: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;

pub use tasks::TaskRepository;

/// Pool owner. Sessions are acquired per operation; transient connection
/// failures during setup retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: AnyPool,
    url: String,
}

impl DatabaseManager {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10).await
    }

    pub async fn connect_with(
        url: &str,
        max_connections: u32,
    ) -> Result<Self> {
        install_default_drivers();
        let is_sqlite = url.starts_with("sqlite");
        let options = AnyPoolOptions::new()
            .max_connections(if is_sqlite { 1 } else { max_connections })
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_sqlite {
                        // SQLite needs this per connection, not per database.
                        sqlx::query("PRAGMA foreign_keys=ON")
                            .execute(conn)
                            .await?;
                    }
                    Ok(())
                })
            });

        let mut attempt = 0;
        let pool = loop {
            match options.clone().connect(url).await {
                Ok(pool) => break pool,
                Err(e) => {
                    attempt += 1;
                    if attempt >= CONNECT_RETRIES {
                        return Err(e.into());
                    }
                    let wait = BACKOFF_BASE_SECS.pow(attempt);
                    warn!(
                        "database connection failed: {e}; \
                         retrying ({attempt}/{CONNECT_RETRIES}) in {wait}s"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
            }
        };
        info!("database configured with {url}");
        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite")
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    /// Idempotent schema bootstrap; both backends accept the same DDL.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database connection closed");
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS clients (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL UNIQUE,
        client_secret TEXT NOT NULL,
        audience TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        status TEXT NOT NULL,
        input_timeout BIGINT NOT NULL DEFAULT 180,
        input_request_id TEXT,
        results TEXT,
        schedule_type TEXT,
        scheduled_time TEXT,
        cron_expression TEXT,
        expires_at TEXT,
        triggered_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_client_id ON tasks (client_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_flow_id ON tasks (flow_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
];

/// Timestamp column format. A fixed precision keeps TEXT ordering in sync
/// with chronological ordering.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            RunnerError::internal(format!("bad timestamp {raw:?}: {e}"))
        })
}

#[cfg(test)]
mod test_support {
    use super::*;

    pub async fn memory_db() -> DatabaseManager {
        let db = DatabaseManager::connect("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        db
    }
}

#[cfg(test)]
pub(crate) use test_support::memory_db;
