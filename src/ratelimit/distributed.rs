//! Distributed rate limiter backed by a shared store.
//!
//! Every check is one atomic script execution in the store, so concurrent
//! callers on any number of instances can never jointly over-admit a key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backend::{RateLimitResult, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::key::WindowKey;
use super::rules::RateLimitConfig;
use super::script::{ScriptReply, ScriptState, SLIDING_WINDOW_SCRIPT};
use crate::error::{LimiterError, Result};
use crate::store::{StoreResult, WindowStore};

/// Settings for [`DistributedRateLimiter`].
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Prefix applied to every store key, scoping pattern resets
    pub namespace: String,
    /// Upper bound on any single store call
    pub command_timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            namespace: "ratelimit:".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// A sliding window limiter whose state lives in a shared store.
pub struct DistributedRateLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    config: DistributedConfig,
    script: RwLock<ScriptState>,
    instance_id: Uuid,
}

impl DistributedRateLimiter {
    /// Create a distributed limiter on the system clock.
    pub fn new(store: Arc<dyn WindowStore>, config: DistributedConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a distributed limiter reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn WindowStore>,
        config: DistributedConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = Uuid::new_v4();
        debug!(
            instance_id = %instance_id,
            namespace = %config.namespace,
            "Distributed rate limiter created"
        );

        Self {
            store,
            clock,
            config,
            script: RwLock::new(ScriptState::NotLoaded),
            instance_id,
        }
    }

    /// The store this limiter talks to.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Current script load state.
    pub fn script_state(&self) -> ScriptState {
        self.script.read().clone()
    }

    /// Upload the script ahead of the first check.
    pub async fn preload(&self) -> Result<()> {
        self.ensure_loaded().await.map(|_| ())
    }

    /// Run a store call under the command timeout.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, call).await {
            Ok(result) => result.map_err(LimiterError::from),
            Err(_) => Err(LimiterError::BackendUnavailable(format!(
                "{} timed out after {:?}",
                op, self.config.command_timeout
            ))),
        }
    }

    async fn ensure_loaded(&self) -> Result<String> {
        let cached = self.script.read().sha().map(str::to_owned);
        if let Some(sha) = cached {
            return Ok(sha);
        }

        let sha = self
            .bounded("SCRIPT LOAD", self.store.script_load(SLIDING_WINDOW_SCRIPT))
            .await?;
        info!(sha = %sha, "Sliding window script loaded");
        *self.script.write() = ScriptState::Loaded { sha: sha.clone() };
        Ok(sha)
    }

    /// Execute the script by reference, falling back to the full body once
    /// when the store has forgotten the reference.
    async fn run_script(&self, keys: &[String], args: &[String]) -> Result<Vec<i64>> {
        let sha = self.ensure_loaded().await?;

        match self
            .bounded("EVALSHA", self.store.eval_sha(&sha, keys, args))
            .await
        {
            Err(LimiterError::ScriptNotLoaded) => {
                warn!(sha = %sha, "Store lost the script reference, resubmitting full body");
                *self.script.write() = ScriptState::NotLoaded;
                self.bounded("EVAL", self.store.eval(SLIDING_WINDOW_SCRIPT, keys, args))
                    .await
            }
            other => other,
        }
    }

    fn unique_member(&self, now_ms: u64) -> String {
        format!(
            "{}-{}-{:016x}",
            now_ms,
            self.instance_id.simple(),
            rand::random::<u64>()
        )
    }
}

/// Escape glob metacharacters so `text` matches only itself.
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check_limit(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult> {
        let key = WindowKey::new(config, identifier);
        let now = self.clock.now_ms();

        let keys = [key.storage_key(&self.config.namespace)];
        let args = [
            now.to_string(),
            config.window_ms().to_string(),
            config.max_requests().to_string(),
            self.unique_member(now),
        ];

        let raw = self.run_script(&keys, &args).await?;
        let reply = ScriptReply::parse(&raw, config.max_requests(), now).map_err(|reason| {
            error!(key = %key, reply = ?raw, reason = %reason, "Impossible reply from rate limit script");
            LimiterError::Anomaly(reason)
        })?;

        trace!(
            key = %key,
            allowed = reply.allowed,
            remaining = reply.remaining,
            "Distributed rate limit check"
        );

        let mut result = RateLimitResult::from_window(
            reply.allowed,
            config.max_requests(),
            reply.remaining,
            reply.reset_at_ms,
            now,
        );
        if !reply.allowed {
            result.retry_after = Some(reply.retry_after_secs);
        }
        Ok(result)
    }

    async fn reset(&self, identifier: &str, config: &RateLimitConfig) -> Result<()> {
        let key = WindowKey::new(config, identifier);
        let keys = [key.storage_key(&self.config.namespace)];
        self.bounded("DEL", self.store.delete(&keys)).await?;
        debug!(key = %key, "Distributed window reset");
        Ok(())
    }

    async fn reset_pattern(&self, pattern: &str) -> Result<u64> {
        let scoped = format!("{}{}", escape_glob(&self.config.namespace), pattern);
        let keys = self.bounded("SCAN", self.store.scan_match(&scoped)).await?;
        let removed = self.bounded("DEL", self.store.delete(&keys)).await?;

        debug!(pattern = %scoped, removed = removed, "Distributed windows reset by pattern");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        self.bounded("PING", self.store.ping()).await.is_ok()
    }

    async fn cleanup(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError};
    use tokio_test::assert_ok;

    const START: u64 = 1_700_000_000_000;

    fn limit(window_secs: u64, max: u32, prefix: &str) -> RateLimitConfig {
        RateLimitConfig::new(Duration::from_secs(window_secs), max, prefix).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, DistributedRateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let limiter =
            DistributedRateLimiter::with_clock(store.clone(), DistributedConfig::default(), clock.clone());
        (store, clock, limiter)
    }

    #[tokio::test]
    async fn test_simple_exhaustion() {
        let (_, _, limiter) = setup();
        let config = limit(60, 2, "t:");

        let first = limiter.check_limit("u1", &config).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = limiter.check_limit("u1", &config).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_limit("u1", &config).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (store, _, limiter) = setup();
        let config = limit(60, 2, "pwreset:");

        limiter.check_limit("alice", &config).await.unwrap();
        assert_eq!(store.cardinality("ratelimit:pwreset:alice"), 1);
    }

    #[tokio::test]
    async fn test_boundary_timing() {
        let (_, clock, limiter) = setup();
        let config = limit(10, 1, "t:");

        assert!(limiter.check_limit("u1", &config).await.unwrap().allowed);

        clock.set(START + 9_999);
        let denied = limiter.check_limit("u1", &config).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at.timestamp_millis() as u64, START + 10_000);

        clock.set(START + 10_001);
        assert!(limiter.check_limit("u1", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_prefix_and_identifier_isolation() {
        let (_, _, limiter) = setup();
        let a = limit(60, 1, "a:");
        let b = limit(60, 1, "b:");

        assert!(limiter.check_limit("shared-id", &a).await.unwrap().allowed);
        assert!(!limiter.check_limit("shared-id", &a).await.unwrap().allowed);
        assert!(limiter.check_limit("shared-id", &b).await.unwrap().allowed);
        assert!(limiter.check_limit("other-id", &a).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_script_loaded_once_then_by_reference() {
        let (store, _, limiter) = setup();
        let config = limit(60, 10, "t:");
        assert_eq!(limiter.script_state(), ScriptState::NotLoaded);

        for _ in 0..3 {
            limiter.check_limit("u1", &config).await.unwrap();
        }

        assert_eq!(store.script_loads(), 1);
        assert_eq!(store.sha_evals(), 3);
        assert_eq!(store.full_evals(), 0);
        assert!(limiter.script_state().sha().is_some());
    }

    #[tokio::test]
    async fn test_script_resubmitted_after_store_restart() {
        let (store, _, limiter) = setup();
        let config = limit(60, 10, "t:");

        limiter.check_limit("u1", &config).await.unwrap();
        store.flush_scripts();

        let result = limiter.check_limit("u1", &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 8);
        assert_eq!(store.full_evals(), 1);
        assert_eq!(limiter.script_state(), ScriptState::NotLoaded);

        limiter.check_limit("u1", &config).await.unwrap();
        assert_eq!(store.script_loads(), 2);
        assert!(limiter.script_state().sha().is_some());
    }

    #[tokio::test]
    async fn test_outage_is_reported_not_folded() {
        let (store, _, limiter) = setup();
        let config = limit(60, 10, "t:");
        store.set_available(false);

        let err = limiter.check_limit("u1", &config).await.unwrap_err();
        assert!(matches!(err, LimiterError::BackendUnavailable(_)));
        assert!(!limiter.health_check().await);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryStore::new());
        let limiter = DistributedRateLimiter::new(
            store.clone(),
            DistributedConfig {
                command_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        store.set_latency(Some(Duration::from_millis(200)));

        let err = limiter
            .check_limit("u1", &limit(60, 10, "t:"))
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_reset_then_check_is_fresh() {
        let (_, _, limiter) = setup();
        let config = limit(60, 3, "t:");

        for _ in 0..5 {
            limiter.check_limit("u1", &config).await.unwrap();
        }
        assert_ok!(limiter.reset("u1", &config).await);

        let result = limiter.check_limit("u1", &config).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_pattern_scoped_to_namespace() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let ours = DistributedRateLimiter::with_clock(store.clone(), DistributedConfig::default(), clock.clone());
        let theirs = DistributedRateLimiter::with_clock(
            store.clone(),
            DistributedConfig {
                namespace: "other:".to_string(),
                ..Default::default()
            },
            clock,
        );
        let config = limit(60, 3, "api:");

        ours.check_limit("1", &config).await.unwrap();
        ours.check_limit("2", &config).await.unwrap();
        theirs.check_limit("1", &config).await.unwrap();

        assert_eq!(ours.reset_pattern("api:*").await.unwrap(), 2);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.cardinality("other:api:1"), 1);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("ratelimit:"), "ratelimit:");
        assert_eq!(escape_glob("a*b?[c]"), r"a\*b\?\[c\]");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_race_across_instances() {
        let store = Arc::new(MemoryStore::new());
        let instances: Vec<Arc<DistributedRateLimiter>> = (0..4)
            .map(|_| Arc::new(DistributedRateLimiter::new(store.clone(), DistributedConfig::default())))
            .collect();
        let config = limit(60, 10, "race:");

        let mut handles = Vec::new();
        for i in 0..20 {
            let limiter = instances[i % instances.len()].clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_limit("race", &config).await.unwrap().allowed
            }));
        }

        let results = futures::future::join_all(handles).await;
        let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(allowed, 10);
        assert_eq!(store.cardinality("ratelimit:race:race"), 10);
    }

    struct GarbageStore;

    #[async_trait]
    impl WindowStore for GarbageStore {
        async fn script_load(&self, _body: &str) -> StoreResult<String> {
            Ok("sha".to_string())
        }
        async fn eval_sha(&self, _: &str, _: &[String], _: &[String]) -> StoreResult<Vec<i64>> {
            Ok(vec![1, 99, 0, 0])
        }
        async fn eval(&self, _: &str, _: &[String], _: &[String]) -> StoreResult<Vec<i64>> {
            Err(StoreError::Protocol("unused".to_string()))
        }
        async fn delete(&self, _: &[String]) -> StoreResult<u64> {
            Ok(0)
        }
        async fn scan_match(&self, _: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Always refuses with a fixed retry delay.
    struct RefusingStore {
        reset_at: i64,
        retry_after: i64,
    }

    #[async_trait]
    impl WindowStore for RefusingStore {
        async fn script_load(&self, _body: &str) -> StoreResult<String> {
            Ok("sha".to_string())
        }
        async fn eval_sha(&self, _: &str, _: &[String], _: &[String]) -> StoreResult<Vec<i64>> {
            Ok(vec![0, 0, self.reset_at, self.retry_after])
        }
        async fn eval(&self, _: &str, _: &[String], _: &[String]) -> StoreResult<Vec<i64>> {
            Err(StoreError::Protocol("unused".to_string()))
        }
        async fn delete(&self, _: &[String]) -> StoreResult<u64> {
            Ok(0)
        }
        async fn scan_match(&self, _: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_after_comes_from_script_reply() {
        let limiter = DistributedRateLimiter::with_clock(
            Arc::new(RefusingStore {
                reset_at: (START + 4_500) as i64,
                retry_after: 5,
            }),
            DistributedConfig::default(),
            Arc::new(ManualClock::new(START)),
        );

        let result = limiter.check_limit("u1", &limit(60, 5, "t:")).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(5));
        assert_eq!(result.reset_at.timestamp_millis() as u64, START + 4_500);
    }

    #[tokio::test]
    async fn test_refusal_without_retry_delay_is_anomaly() {
        let limiter = DistributedRateLimiter::with_clock(
            Arc::new(RefusingStore {
                reset_at: (START + 4_500) as i64,
                retry_after: 0,
            }),
            DistributedConfig::default(),
            Arc::new(ManualClock::new(START)),
        );

        let err = limiter.check_limit("u1", &limit(60, 5, "t:")).await.unwrap_err();
        assert!(matches!(err, LimiterError::Anomaly(_)));
    }

    #[tokio::test]
    async fn test_impossible_reply_is_anomaly() {
        let limiter = DistributedRateLimiter::new(Arc::new(GarbageStore), DistributedConfig::default());
        let err = limiter
            .check_limit("u1", &limit(60, 5, "t:"))
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Anomaly(_)));
    }
}
