//! Counters describing how the hybrid limiter is serving checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters updated on every check.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    distributed_checks: AtomicU64,
    local_checks: AtomicU64,
    fail_open: AtomicU64,
    backend_errors: AtomicU64,
    failovers: AtomicU64,
    recoveries: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
}

/// Which path served a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    Distributed,
    Local,
    FailOpen,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed check.
    pub fn record_check(&self, allowed: bool, served_by: ServedBy, latency: Duration) {
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }

        let path = match served_by {
            ServedBy::Distributed => &self.distributed_checks,
            ServedBy::Local => &self.local_checks,
            ServedBy::FailOpen => &self.fail_open,
        };
        path.fetch_add(1, Ordering::Relaxed);

        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_max_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A HEALTHY -> DEGRADED transition.
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// A DEGRADED -> HEALTHY transition.
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let denied = self.denied.load(Ordering::Relaxed);
        let total = allowed + denied;
        let latency_total_us = self.latency_total_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            allowed,
            denied,
            distributed_checks: self.distributed_checks.load(Ordering::Relaxed),
            local_checks: self.local_checks.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            avg_latency_us: if total == 0 { 0 } else { latency_total_us / total },
            max_latency_us: self.latency_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`LimiterMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub distributed_checks: u64,
    pub local_checks: u64,
    pub fail_open: u64,
    pub backend_errors: u64,
    pub failovers: u64,
    pub recoveries: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
}

impl MetricsSnapshot {
    /// Fraction of checks that were refused (0.0 to 1.0).
    pub fn denial_rate(&self) -> f64 {
        let total = self.allowed + self.denied;
        if total == 0 {
            0.0
        } else {
            self.denied as f64 / total as f64
        }
    }

    /// Fraction of checks served without the shared store.
    pub fn degraded_ratio(&self) -> f64 {
        let total = self.allowed + self.denied;
        if total == 0 {
            0.0
        } else {
            (self.local_checks + self.fail_open) as f64 / total as f64
        }
    }
}
