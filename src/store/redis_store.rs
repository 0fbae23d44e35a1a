//! Redis-backed [`WindowStore`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{StoreError, StoreResult, WindowStore};

/// Number of keys requested per SCAN round-trip.
const SCAN_BATCH: usize = 500;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (`redis://host:port/db`)
    pub url: String,
    /// Upper bound on establishing the connection
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            ErrorKind::NoScriptError => StoreError::NoScript,
            ErrorKind::TypeError | ErrorKind::ResponseError => {
                StoreError::Protocol(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// A [`WindowStore`] talking to Redis through a reconnecting
/// [`ConnectionManager`].
///
/// The connection is established on first use, so a process can start while
/// Redis is down and pick it up once it comes back.
pub struct RedisStore {
    client: Client,
    manager: Mutex<Option<ConnectionManager>>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &redact_url(&self.config.url))
            .field("connect_timeout", &self.config.connect_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given configuration without connecting.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;

        info!(url = %redact_url(&config.url), "Redis store configured");

        Ok(Self {
            client,
            manager: Mutex::new(None),
            config,
        })
    }

    /// Get a handle to the shared connection, connecting if needed.
    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Establishing Redis connection");
        let conn = tokio::time::timeout(
            self.config.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| StoreError::Unavailable("redis connect timed out".to_string()))??;

        info!("Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn script_load(&self, body: &str) -> StoreResult<String> {
        let mut conn = self.connection().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = redis::cmd("EVAL")
            .arg(body)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations.
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut guard = self.manager.lock().await;
        if guard.take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }
}

/// Hide credentials embedded in a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
