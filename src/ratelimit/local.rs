//! In-process sliding window limiter used when the shared store is unavailable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::backend::{RateLimitResult, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::key::{KeyPattern, WindowKey};
use super::rules::RateLimitConfig;
use super::window::SlidingWindow;
use crate::error::{LimiterError, Result};

/// Settings for [`LocalRateLimiter`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// How often idle keys are swept
    pub sweep_interval: Duration,
    /// Upper bound on tracked keys
    pub max_keys: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_keys: 100_000,
        }
    }
}

/// A single-process sliding window limiter.
///
/// Each key's log lives in a sharded map; holding a key's entry is the
/// per-key lock. Requests served by sibling instances are not seen, so this
/// under-counts across a fleet and is meant for degraded operation.
///
/// `tracked` counts reserved key slots. A slot is reserved while the new
/// key's shard is locked, so the table never grows past `max_keys`.
pub struct LocalRateLimiter {
    windows: DashMap<WindowKey, SlidingWindow>,
    tracked: AtomicUsize,
    clock: Arc<dyn Clock>,
    config: LocalConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRateLimiter {
    /// Create a local limiter on the system clock.
    pub fn new(config: LocalConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a local limiter reading time from `clock`.
    pub fn with_clock(config: LocalConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            tracked: AtomicUsize::new(0),
            clock,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweep of idle keys.
    ///
    /// The task only holds a weak reference and exits once the limiter is
    /// dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        }));

        debug!(interval = ?period, "Local limiter sweeper started");
    }

    /// Remove keys whose entries have all expired. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = self.remove_where(|_, window| window.is_idle(now));

        if removed > 0 {
            debug!(removed = removed, remaining = self.windows.len(), "Swept idle keys");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn active_keys(&self) -> usize {
        self.windows.len()
    }

    /// Number of requests counted for `identifier` right now.
    pub fn current_count(&self, identifier: &str, config: &RateLimitConfig) -> usize {
        let key = WindowKey::new(config, identifier);
        let now = self.clock.now_ms();
        self.windows
            .get(&key)
            .map(|window| window.count(now))
            .unwrap_or(0)
    }

    /// Remove every window matching `doomed` and release its slot.
    fn remove_where(&self, mut doomed: impl FnMut(&WindowKey, &SlidingWindow) -> bool) -> usize {
        let mut removed = 0;
        self.windows.retain(|key, window| {
            let remove = doomed(key, window);
            if remove {
                removed += 1;
            }
            !remove
        });
        self.tracked.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Make room for `key` by sweeping when the table looks full.
    ///
    /// Runs before the key's shard is locked, because a sweep locks every
    /// shard.
    fn ensure_capacity(&self, key: &WindowKey) -> Result<()> {
        if self.windows.contains_key(key)
            || self.tracked.load(Ordering::Acquire) < self.config.max_keys
        {
            return Ok(());
        }

        self.sweep();
        if self.tracked.load(Ordering::Acquire) >= self.config.max_keys {
            return Err(self.capacity_error());
        }
        Ok(())
    }

    /// Claim a slot for a new key, failing if the table is full.
    fn reserve_slot(&self) -> Result<()> {
        let max_keys = self.config.max_keys;
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_keys).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| self.capacity_error())
    }

    fn capacity_error(&self) -> LimiterError {
        warn!(
            max_keys = self.config.max_keys,
            "Local limiter key table full"
        );
        LimiterError::LocalCapacity {
            max_keys: self.config.max_keys,
        }
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn check_limit(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult> {
        let key = WindowKey::new(config, identifier);
        self.ensure_capacity(&key)?;

        let now = self.clock.now_ms();
        let window_ms = config.window_ms();
        let decision = match self.windows.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .check(now, window_ms, config.max_requests())
            }
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                entry
                    .insert(SlidingWindow::new(window_ms))
                    .check(now, window_ms, config.max_requests())
            }
        };

        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Local rate limit check"
        );

        Ok(RateLimitResult::from_window(
            decision.allowed,
            config.max_requests(),
            decision.remaining,
            decision.reset_at_ms,
            now,
        ))
    }

    async fn reset(&self, identifier: &str, config: &RateLimitConfig) -> Result<()> {
        let key = WindowKey::new(config, identifier);
        if self.windows.remove(&key).is_some() {
            self.tracked.fetch_sub(1, Ordering::AcqRel);
            debug!(key = %key, "Local window reset");
        }
        Ok(())
    }

    async fn reset_pattern(&self, pattern: &str) -> Result<u64> {
        let pattern = KeyPattern::new(pattern);
        let removed = self.remove_where(|key, _| pattern.matches(key.as_str())) as u64;

        debug!(pattern = %pattern.as_str(), removed = removed, "Local windows reset by pattern");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            debug!("Local limiter sweeper stopped");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
