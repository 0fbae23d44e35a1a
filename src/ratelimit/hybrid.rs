//! Hybrid rate limiter: distributed when the store is healthy, local otherwise.
//!
//! This is the limiter application code calls. It never returns an error
//! from `check_limit`; backend trouble turns into degraded local counting, and
//! if even that fails the request is admitted.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

use super::backend::{RateLimitResult, RateLimiterBackend};
use super::clock::Clock;
use super::health::{HealthMonitor, HealthSnapshot, HealthState};
use super::metrics::{LimiterMetrics, MetricsSnapshot, ServedBy};
use super::rules::RateLimitConfig;
use crate::error::{LimiterError, Result};

/// Composition of a primary (shared) and fallback (local) limiter.
pub struct HybridRateLimiter {
    primary: Arc<dyn RateLimiterBackend>,
    fallback: Arc<dyn RateLimiterBackend>,
    health: Arc<HealthMonitor>,
    metrics: Arc<LimiterMetrics>,
    clock: Arc<dyn Clock>,
}

impl HybridRateLimiter {
    /// Assemble a hybrid limiter from its parts.
    ///
    /// `metrics` should be the same instance the health monitor records
    /// transitions into.
    pub fn new(
        primary: Arc<dyn RateLimiterBackend>,
        fallback: Arc<dyn RateLimiterBackend>,
        health: Arc<HealthMonitor>,
        metrics: Arc<LimiterMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            health,
            metrics,
            clock,
        }
    }

    /// Start the background health probe loop.
    pub fn start(&self) {
        self.health.start();
    }

    /// Read-only access to the health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Current routing state.
    pub fn health_state(&self) -> HealthState {
        self.health.state()
    }

    /// Details of the last health transition.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Probe the store now instead of waiting for the next interval.
    pub async fn probe(&self) -> bool {
        self.health.probe_now().await
    }

    /// Counters for allowed/denied checks, paths taken and latency.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Handle a failed call to the primary outside of `check_limit`.
    fn primary_failed(&self, op: &'static str, err: &LimiterError) {
        self.metrics.record_backend_error();
        if err.is_backend_failure() {
            self.health.mark_degraded(&err.to_string());
        }
        warn!(
            backend = self.primary.name(),
            op = op,
            error = %err,
            "Primary rate limiter call failed"
        );
    }
}

#[async_trait]
impl RateLimiterBackend for HybridRateLimiter {
    #[instrument(skip_all, fields(key_prefix = %config.key_prefix()))]
    async fn check_limit(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult> {
        let started = Instant::now();

        if self.health.is_healthy() {
            match self.primary.check_limit(identifier, config).await {
                Ok(result) => {
                    // A concurrent call may have degraded the monitor meanwhile.
                    if !self.health.is_healthy() {
                        self.health.mark_healthy();
                    }
                    self.metrics
                        .record_check(result.allowed, ServedBy::Distributed, started.elapsed());
                    return Ok(result);
                }
                Err(err) if err.is_backend_failure() => {
                    self.metrics.record_backend_error();
                    self.health.mark_degraded(&err.to_string());
                    warn!(
                        backend = self.primary.name(),
                        error = %err,
                        "Distributed check failed, failing over to local limiter"
                    );
                }
                Err(err) => {
                    self.metrics.record_backend_error();
                    error!(
                        backend = self.primary.name(),
                        error = %err,
                        "Distributed check produced an invalid result, serving locally"
                    );
                }
            }
        }

        match self.fallback.check_limit(identifier, config).await {
            Ok(result) => {
                self.metrics
                    .record_check(result.allowed, ServedBy::Local, started.elapsed());
                debug!(
                    degraded = true,
                    allowed = result.allowed,
                    remaining = result.remaining,
                    "Rate limit served in degraded mode"
                );
                Ok(result)
            }
            Err(err) => {
                let result = RateLimitResult::fail_open(config, self.clock.now_ms());
                self.metrics
                    .record_check(true, ServedBy::FailOpen, started.elapsed());
                error!(
                    backend = self.fallback.name(),
                    error = %err,
                    "No rate limiter could decide, failing open"
                );
                Ok(result)
            }
        }
    }

    async fn reset(&self, identifier: &str, config: &RateLimitConfig) -> Result<()> {
        if self.health.is_healthy() {
            let (primary, fallback) = futures::join!(
                self.primary.reset(identifier, config),
                self.fallback.reset(identifier, config)
            );
            if let Err(err) = primary {
                self.primary_failed("reset", &err);
            }
            if let Err(err) = fallback {
                warn!(error = %err, "Local reset failed");
            }
        } else if let Err(err) = self.fallback.reset(identifier, config).await {
            warn!(error = %err, "Local reset failed");
        }
        Ok(())
    }

    async fn reset_pattern(&self, pattern: &str) -> Result<u64> {
        let mut removed = 0;

        if self.health.is_healthy() {
            let (primary, fallback) = futures::join!(
                self.primary.reset_pattern(pattern),
                self.fallback.reset_pattern(pattern)
            );
            match primary {
                Ok(count) => removed += count,
                Err(err) => self.primary_failed("reset_pattern", &err),
            }
            match fallback {
                Ok(count) => removed += count,
                Err(err) => warn!(error = %err, "Local pattern reset failed"),
            }
        } else {
            match self.fallback.reset_pattern(pattern).await {
                Ok(count) => removed += count,
                Err(err) => warn!(error = %err, "Local pattern reset failed"),
            }
        }

        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        self.health.is_healthy()
    }

    async fn cleanup(&self) -> Result<()> {
        self.health.stop().await;

        if let Err(err) = self.fallback.cleanup().await {
            warn!(backend = self.fallback.name(), error = %err, "Cleanup failed");
        }
        if let Err(err) = self.primary.cleanup().await {
            warn!(backend = self.primary.name(), error = %err, "Cleanup failed");
        }

        debug!("Hybrid rate limiter cleaned up");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
