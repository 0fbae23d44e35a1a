//! Liveness tracking for the shared store.
//!
//! The monitor owns a single HEALTHY/DEGRADED flag. A periodic probe moves
//! it either way; a failed distributed call moves it to DEGRADED at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::metrics::LimiterMetrics;
use crate::store::{StoreError, WindowStore};

/// Routing state of the primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
}

/// Settings for [`HealthMonitor`].
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between scheduled probes
    pub probe_interval: Duration,
    /// Upper bound on one probe
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub transitions: u64,
}

#[derive(Debug)]
struct Details {
    last_checked_at: DateTime<Utc>,
    last_error: Option<String>,
    transitions: u64,
}

struct ProbeTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Periodic prober of the shared store.
pub struct HealthMonitor {
    store: Arc<dyn WindowStore>,
    config: HealthConfig,
    healthy: AtomicBool,
    details: Mutex<Details>,
    metrics: Arc<LimiterMetrics>,
    task: Mutex<Option<ProbeTask>>,
}

impl HealthMonitor {
    /// Create a monitor. It starts out optimistic (HEALTHY).
    pub fn new(store: Arc<dyn WindowStore>, config: HealthConfig, metrics: Arc<LimiterMetrics>) -> Self {
        Self {
            store,
            config,
            healthy: AtomicBool::new(true),
            details: Mutex::new(Details {
                last_checked_at: Utc::now(),
                last_error: None,
                transitions: 0,
            }),
            metrics,
            task: Mutex::new(None),
        }
    }

    /// Whether checks should go to the distributed path.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HealthState {
        if self.is_healthy() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let details = self.details.lock();
        HealthSnapshot {
            state: self.state(),
            last_checked_at: details.last_checked_at,
            last_error: details.last_error.clone(),
            transitions: details.transitions,
        }
    }

    /// Flip to DEGRADED, e.g. after an observed call failure.
    pub fn mark_degraded(&self, reason: &str) {
        let now = Utc::now();
        let was_healthy = self.healthy.swap(false, Ordering::AcqRel);

        let mut details = self.details.lock();
        details.last_checked_at = now;
        details.last_error = Some(reason.to_string());
        if was_healthy {
            details.transitions += 1;
            self.metrics.record_failover();
            warn!(
                at = %now.to_rfc3339(),
                error = %reason,
                "Shared store degraded, serving rate limits locally"
            );
        }
    }

    /// Flip to HEALTHY after a successful probe.
    pub fn mark_healthy(&self) {
        let now = Utc::now();
        let was_healthy = self.healthy.swap(true, Ordering::AcqRel);

        let mut details = self.details.lock();
        details.last_checked_at = now;
        if !was_healthy {
            details.transitions += 1;
            self.metrics.record_recovery();
            info!(
                at = %now.to_rfc3339(),
                previous_error = ?details.last_error,
                "Shared store recovered, resuming distributed rate limiting"
            );
            details.last_error = None;
        }
    }

    /// Probe the store once and update the state. Returns the probe outcome.
    pub async fn probe_now(&self) -> bool {
        let outcome = match tokio::time::timeout(self.config.probe_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "probe timed out after {:?}",
                self.config.probe_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                debug!("Store probe succeeded");
                self.mark_healthy();
                true
            }
            Err(err) => {
                debug!(error = %err, "Store probe failed");
                self.mark_degraded(&err.to_string());
                false
            }
        }
    }

    /// Start the background probe loop. The first probe runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let monitor: Weak<Self> = Arc::downgrade(self);
        let period = self.config.probe_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.probe_now().await;
            }
            debug!("Health probe loop exited");
        });

        *slot = Some(ProbeTask { handle, shutdown });
        info!(interval = ?period, "Health monitor started");
    }

    /// Stop the background probe loop and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
            info!("Health monitor stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn monitor(store: Arc<MemoryStore>, interval: Duration) -> (Arc<LimiterMetrics>, Arc<HealthMonitor>) {
        let metrics = Arc::new(LimiterMetrics::new());
        let monitor = Arc::new(HealthMonitor::new(
            store,
            HealthConfig {
                probe_interval: interval,
                probe_timeout: Duration::from_millis(50),
            },
            metrics.clone(),
        ));
        (metrics, monitor)
    }

    #[tokio::test]
    async fn test_starts_optimistic() {
        let (_, monitor) = monitor(Arc::new(MemoryStore::new()), Duration::from_secs(30));
        assert!(monitor.is_healthy());
        assert_eq!(monitor.state(), HealthState::Healthy);
        assert_eq!(monitor.snapshot().transitions, 0);
    }

    #[tokio::test]
    async fn test_call_failure_degrades_immediately() {
        let (metrics, monitor) = monitor(Arc::new(MemoryStore::new()), Duration::from_secs(30));

        monitor.mark_degraded("connection reset");
        assert!(!monitor.is_healthy());

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.state, HealthState::Degraded);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection reset"));
        assert_eq!(snapshot.transitions, 1);

        // Repeated failures are not new transitions.
        monitor.mark_degraded("connection reset");
        assert_eq!(monitor.snapshot().transitions, 1);
        assert_eq!(metrics.snapshot().failovers, 1);
    }

    #[tokio::test]
    async fn test_snapshot_serializes_to_json() {
        let (_, monitor) = monitor(Arc::new(MemoryStore::new()), Duration::from_secs(30));
        monitor.mark_degraded("connection refused");

        let json = serde_json::to_value(monitor.snapshot()).unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["last_error"], "connection refused");
        assert!(json["last_checked_at"].is_string());
    }

    #[tokio::test]
    async fn test_health_check_transitions() {
        let store = Arc::new(MemoryStore::new());
        let (metrics, monitor) = monitor(store.clone(), Duration::from_secs(30));

        store.set_available(false);
        assert!(!monitor.probe_now().await);
        assert_eq!(monitor.state(), HealthState::Degraded);

        store.set_available(true);
        assert!(monitor.probe_now().await);
        assert_eq!(monitor.state(), HealthState::Healthy);
        assert_eq!(monitor.snapshot().last_error, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failovers, 1);
        assert_eq!(snapshot.recoveries, 1);
    }

    #[tokio::test]
    async fn test_slow_health_check_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let (_, monitor) = monitor(store.clone(), Duration::from_secs(30));

        store.set_latency(Some(Duration::from_millis(200)));
        assert!(!monitor.probe_now().await);
        assert!(monitor.snapshot().last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_background_loop_recovers() {
        let store = Arc::new(MemoryStore::new());
        let (_, monitor) = monitor(store.clone(), Duration::from_millis(30));

        monitor.mark_degraded("simulated call failure");
        monitor.start();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.is_healthy());

        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!monitor.is_healthy());

        monitor.stop().await;
    }
}
