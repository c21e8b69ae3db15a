//! # Waldiez Runner Server
//!
//! Multi-tenant task execution service for Waldiez workflows: clients
//! submit self-contained workflow files, the service authenticates them,
//! queues jobs, executes each one in an isolated subprocess, streams its
//! I/O over Redis, persists state in a relational database and exposes the
//! lifecycle over HTTP and WebSocket.
//!
//! ## Architecture
//!
//! Built on axum and the `waldiez-runner-core` orchestration crate:
//! - PostgreSQL or SQLite for persistent task state
//! - Redis for the job queue, output streams and control channels
//! - A worker pool supervising one child process per running task

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

use anyhow::Context as _;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use waldiez_runner_core::broker::{
    InMemoryJobQueue, JobQueue, RedisJobQueue,
};
use waldiez_runner_core::db::DatabaseManager;
use waldiez_runner_core::maintenance::{Maintenance, MaintenanceConfig};
use waldiez_runner_core::redis::RedisManager;
use waldiez_runner_core::runner::RunnerPool;
use waldiez_runner_core::storage::LocalStorage;
use waldiez_runner_core::AppContext;

use crate::auth::TokenVerifier;
use crate::config::Settings;
use crate::state::AppState;

pub fn init_tracing(settings: &Settings) {
    let default_filter = format!(
        "waldiez_runner_server={level},waldiez_runner_core={level},\
         tower_http=info",
        level = settings.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application context from settings: storage, database, Redis,
/// and the job queue implementation smoke mode selects.
pub async fn build_context(
    settings: &Settings,
) -> anyhow::Result<Arc<AppContext>> {
    let storage = LocalStorage::new(&settings.storage_root)
        .context("failed to initialize storage")?;
    info!("storage root: {}", storage.root().display());

    let db = DatabaseManager::connect(&settings.db_url)
        .await
        .context("database connection failed")?;
    db.ensure_schema()
        .await
        .context("schema initialization failed")?;

    let redis = if settings.no_redis {
        RedisManager::new(&settings.redis_url)?
    } else {
        RedisManager::connect(&settings.redis_url)
            .await
            .context("redis connection failed")?
    };

    let queue: Arc<dyn JobQueue> = if settings.no_redis {
        warn!("running with the in-process job queue (smoke mode)");
        Arc::new(InMemoryJobQueue::new())
    } else {
        Arc::new(RedisJobQueue::new(redis.clone()))
    };

    Ok(Arc::new(AppContext::new(
        db,
        Arc::new(storage),
        redis,
        queue,
        settings.runner_config(),
    )))
}

pub fn build_router(state: AppState) -> axum::Router {
    routes::api_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let ctx = build_context(&settings).await?;
    let verifier = Arc::new(TokenVerifier::new(&settings.secret_key));
    let state = AppState::new(ctx.clone(), verifier);

    let pool = RunnerPool::start(ctx.clone());
    let maintenance =
        Maintenance::start(ctx.clone(), MaintenanceConfig::default());

    let app = build_router(state);
    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    pool.shutdown().await;
    maintenance.shutdown().await;
    // No RUNNING rows may survive this process.
    match ctx.tasks().mark_all_active_failed().await {
        Ok(0) => {}
        Ok(count) => warn!("marked {count} in-flight tasks failed"),
        Err(e) => warn!("failed to mark active tasks failed: {e}"),
    }
    ctx.db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests;
