//! Redis connectivity.
//!
//! One shared multiplexed [`ConnectionManager`] serves the publisher path
//! (XADD, PUBLISH, queue pushes). Subscribers and blocking consumers get
//! dedicated connections, because pub/sub and BRPOP monopolize whatever
//! connection they run on.

pub mod io_stream;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::Result;

/// Connection owner. Construction only parses the URL; the first use of
/// [`RedisManager::connection`] dials out, so contexts can be built before
/// (or without) a reachable broker.
#[derive(Clone)]
pub struct RedisManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    url: String,
}

impl std::fmt::Debug for RedisManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisManager")
            .field("url", &self.inner.url)
            .finish()
    }
}

impl RedisManager {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                conn: OnceCell::new(),
                url: url.to_string(),
            }),
        })
    }

    /// Parse the URL and dial out immediately, failing fast on an
    /// unreachable broker.
    pub async fn connect(url: &str) -> Result<Self> {
        let manager = Self::new(url)?;
        manager.connection().await?;
        Ok(manager)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Shared publisher-path connection; cheap to clone, reconnects on its
    /// own.
    pub async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .inner
            .conn
            .get_or_try_init(|| async {
                info!("connecting to Redis at {}", self.inner.url);
                ConnectionManager::new(self.inner.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Dedicated pub/sub connection. The caller owns its lifecycle and must
    /// unsubscribe before dropping it on the happy path.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        Ok(self.inner.client.get_async_pubsub().await?)
    }

    /// Dedicated connection for blocking consumers (BRPOP).
    pub async fn dedicated(
        &self,
    ) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self
            .inner
            .client
            .get_multiplexed_async_connection()
            .await?)
    }
}
