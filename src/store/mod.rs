//! Shared key-value store abstraction.
//!
//! The distributed limiter only needs a handful of primitives from the
//! store: server-side script execution (by reference and by full body),
//! key deletion, pattern scans and a liveness probe. Redis satisfies all of
//! them; [`MemoryStore`] emulates them in-process for tests and single-node
//! use.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a [`WindowStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The script reference passed to `eval_sha` is unknown to the store.
    #[error("NOSCRIPT: script reference not found")]
    NoScript,
    /// Connection, network or timeout failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with a reply of the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the distributed limiter requires from the shared store.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Upload a script body and return its reference (SHA1 hex digest).
    async fn script_load(&self, body: &str) -> StoreResult<String>;

    /// Execute a previously loaded script by reference.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>>;

    /// Execute a script by submitting its full body.
    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// List keys matching a glob pattern.
    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Lightweight liveness check.
    async fn ping(&self) -> StoreResult<()>;

    /// Release connections held by the store.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Compute the reference a store assigns to a script body.
pub fn script_sha(body: &str) -> String {
    ::redis::Script::new(body).get_hash().to_string()
}
