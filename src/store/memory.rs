//! In-process [`WindowStore`] emulating the Redis sliding-window script.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{script_sha, StoreError, StoreResult, WindowStore};
use crate::ratelimit::{KeyPattern, SLIDING_WINDOW_SCRIPT};

/// One sorted set: entries ordered by (score, member) plus its expiry.
#[derive(Debug, Default)]
struct SortedLog {
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, SortedLog>,
    scripts: HashSet<String>,
}

/// A [`WindowStore`] kept entirely in memory.
///
/// Script execution happens under a single lock, so it is atomic in the same
/// way a Redis script is. Only the sliding-window script is understood.
/// Faults can be injected to exercise failover paths.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
    script_loads: AtomicU64,
    sha_evals: AtomicU64,
    full_evals: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
            script_loads: AtomicU64::new(0),
            sha_evals: AtomicU64::new(0),
            full_evals: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Forget all loaded scripts, as a store restart would.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Number of `script_load` calls served.
    pub fn script_loads(&self) -> u64 {
        self.script_loads.load(Ordering::Relaxed)
    }

    /// Number of successful by-reference executions.
    pub fn sha_evals(&self) -> u64 {
        self.sha_evals.load(Ordering::Relaxed)
    }

    /// Number of full-body executions.
    pub fn full_evals(&self) -> u64 {
        self.full_evals.load(Ordering::Relaxed)
    }

    /// Number of entries stored under `key`.
    pub fn cardinality(&self, key: &str) -> usize {
        self.state
            .lock()
            .sets
            .get(key)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.state.lock().sets.len()
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Run the sliding-window algorithm against one key.
    fn execute(&self, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::Protocol("script expects one key".to_string()))?;
        if args.len() != 4 {
            return Err(StoreError::Protocol(format!(
                "script expects 4 arguments, got {}",
                args.len()
            )));
        }
        let now = parse_arg(&args[0])?;
        let window = parse_arg(&args[1])?;
        let limit = parse_arg(&args[2])?;
        let member = args[3].clone();

        let mut state = self.state.lock();

        if state
            .sets
            .get(key)
            .is_some_and(|log| log.expires_at_ms <= now)
        {
            state.sets.remove(key);
        }

        let window_start = now - window;
        let log = state.sets.entry(key.clone()).or_default();
        log.entries.retain(|(score, _)| *score > window_start);

        let count = log.entries.len() as i64;
        if count < limit {
            log.entries.insert((now, member));
            log.expires_at_ms = now + window;
            return Ok(vec![1, limit - count - 1, now + window, 0]);
        }

        let reset_at = log
            .entries
            .iter()
            .next()
            .map(|(score, _)| score + window)
            .unwrap_or(now + window);
        if log.entries.is_empty() {
            state.sets.remove(key);
        }
        let retry_after = (reset_at - now + 999) / 1000;
        Ok(vec![0, 0, reset_at, retry_after])
    }
}

fn parse_arg(raw: &str) -> StoreResult<i64> {
    raw.parse()
        .map_err(|_| StoreError::Protocol(format!("non-numeric script argument: {}", raw)))
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn script_load(&self, body: &str) -> StoreResult<String> {
        self.enter().await?;
        if body != SLIDING_WINDOW_SCRIPT {
            return Err(StoreError::Protocol("unsupported script".to_string()));
        }
        let sha = script_sha(body);
        self.state.lock().scripts.insert(sha.clone());
        self.script_loads.fetch_add(1, Ordering::Relaxed);
        debug!(sha = %sha, "Script loaded into memory store");
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>> {
        self.enter().await?;
        if !self.state.lock().scripts.contains(sha) {
            return Err(StoreError::NoScript);
        }
        let reply = self.execute(keys, args)?;
        self.sha_evals.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> StoreResult<Vec<i64>> {
        self.enter().await?;
        if body != SLIDING_WINDOW_SCRIPT {
            return Err(StoreError::Protocol("unsupported script".to_string()));
        }
        // EVAL caches the body under its digest, as Redis does.
        self.state.lock().scripts.insert(script_sha(body));
        let reply = self.execute(keys, args)?;
        self.full_evals.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.enter().await?;
        let mut state = self.state.lock();
        let removed = keys
            .iter()
            .filter(|key| state.sets.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.enter().await?;
        let pattern = KeyPattern::new(pattern);
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .sets
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.enter().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(now: i64, window: i64, limit: i64, member: &str) -> Vec<String> {
        vec![
            now.to_string(),
            window.to_string(),
            limit.to_string(),
            member.to_string(),
        ]
    }

    #[tokio::test]
    async fn test_eval_sha_requires_loaded_script() {
        let store = MemoryStore::new();
        let sha = script_sha(SLIDING_WINDOW_SCRIPT);
        let keys = vec!["k".to_string()];

        let err = store
            .eval_sha(&sha, &keys, &args(1_000, 1_000, 1, "a"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoScript);

        let loaded = store.script_load(SLIDING_WINDOW_SCRIPT).await.unwrap();
        assert_eq!(loaded, sha);
        let reply = store
            .eval_sha(&sha, &keys, &args(1_000, 1_000, 1, "a"))
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 0, 2_000, 0]);
    }

    #[tokio::test]
    async fn test_script_trims_and_denies() {
        let store = MemoryStore::new();
        let keys = vec!["k".to_string()];

        store.eval(SLIDING_WINDOW_SCRIPT, &keys, &args(1_000, 10_000, 2, "a")).await.unwrap();
        store.eval(SLIDING_WINDOW_SCRIPT, &keys, &args(2_000, 10_000, 2, "b")).await.unwrap();

        let denied = store
            .eval(SLIDING_WINDOW_SCRIPT, &keys, &args(3_000, 10_000, 2, "c"))
            .await
            .unwrap();
        assert_eq!(denied, vec![0, 0, 11_000, 8]);
        assert_eq!(store.cardinality("k"), 2);

        // The first entry expires exactly at 11_000.
        let allowed = store
            .eval(SLIDING_WINDOW_SCRIPT, &keys, &args(11_000, 10_000, 2, "d"))
            .await
            .unwrap();
        assert_eq!(allowed[0], 1);
        assert_eq!(store.cardinality("k"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.script_load(SLIDING_WINDOW_SCRIPT).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let store = MemoryStore::new();
        for key in ["rl:a:1", "rl:a:2", "rl:b:1"] {
            store
                .eval(SLIDING_WINDOW_SCRIPT, &[key.to_string()], &args(1, 100, 5, "m"))
                .await
                .unwrap();
        }

        let keys = store.scan_match("rl:a:*").await.unwrap();
        assert_eq!(keys, vec!["rl:a:1".to_string(), "rl:a:2".to_string()]);

        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_scripts_forgets_references() {
        let store = MemoryStore::new();
        let sha = store.script_load(SLIDING_WINDOW_SCRIPT).await.unwrap();
        store.flush_scripts();

        let err = store
            .eval_sha(&sha, &["k".to_string()], &args(1, 100, 5, "m"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NoScript);
    }
}
