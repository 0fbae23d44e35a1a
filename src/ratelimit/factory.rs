//! Construction of the process-wide hybrid limiter and named limits.
//!
//! One [`LimiterFactory`] is built at startup and passed to whatever needs
//! rate limiting. It builds the hybrid limiter on first use and hands out the
//! same instance afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::backend::{RateLimitResult, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::distributed::DistributedRateLimiter;
use super::health::HealthMonitor;
use super::hybrid::HybridRateLimiter;
use super::local::LocalRateLimiter;
use super::metrics::LimiterMetrics;
use super::rules::{LimitRule, RateLimitConfig, TimeUnit};
use crate::config::ServiceConfig;
use crate::error::{LimiterError, Result};
use crate::store::{RedisStore, WindowStore};

/// Built-in limits for common use-cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseCase {
    /// Password-reset emails per address: 3 per hour
    PasswordReset,
    /// API calls per user: 100 per minute
    ApiPerUser,
    /// Global ceiling per client IP: 1000 per minute
    IpGlobal,
}

impl UseCase {
    pub const ALL: [UseCase; 3] = [UseCase::PasswordReset, UseCase::ApiPerUser, UseCase::IpGlobal];

    /// Name under which the limit is registered and may be overridden.
    pub fn name(&self) -> &'static str {
        match self {
            UseCase::PasswordReset => "password_reset",
            UseCase::ApiPerUser => "api_per_user",
            UseCase::IpGlobal => "ip_global",
        }
    }

    /// The rule used when configuration does not override it.
    pub fn default_rule(&self) -> LimitRule {
        match self {
            UseCase::PasswordReset => LimitRule::per(3, TimeUnit::Hour, "pwreset:"),
            UseCase::ApiPerUser => LimitRule::per(100, TimeUnit::Minute, "api:user:"),
            UseCase::IpGlobal => LimitRule::per(1000, TimeUnit::Minute, "ip:"),
        }
    }
}

/// Builds and memoizes the hybrid limiter for a process.
pub struct LimiterFactory {
    config: ServiceConfig,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    limits: HashMap<String, RateLimitConfig>,
    limiter: OnceCell<Arc<HybridRateLimiter>>,
}

impl LimiterFactory {
    /// Create a factory talking to the Redis instance named in `config`.
    ///
    /// No connection is made here; the store connects on first use.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let store = RedisStore::new(config.redis_config())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        Self::with_store(config, Arc::new(store))
    }

    /// Create a factory over an existing store.
    pub fn with_store(config: ServiceConfig, store: Arc<dyn WindowStore>) -> Result<Self> {
        config.validate()?;

        let mut limits = HashMap::new();
        for use_case in UseCase::ALL {
            let rule = config
                .limits
                .get(use_case.name())
                .cloned()
                .unwrap_or_else(|| use_case.default_rule());
            limits.insert(use_case.name().to_string(), RateLimitConfig::try_from(&rule)?);
        }
        for (name, rule) in &config.limits {
            limits.insert(name.clone(), RateLimitConfig::try_from(rule)?);
        }

        info!(limits = limits.len(), "Rate limit factory configured");

        Ok(Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            limits,
            limiter: OnceCell::new(),
        })
    }

    /// Use a different time source for every limiter built.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The shared hybrid limiter, built on first call.
    pub async fn limiter(&self) -> Arc<HybridRateLimiter> {
        self.limiter
            .get_or_init(|| self.build())
            .await
            .clone()
    }

    /// The validated configuration of a named limit.
    pub fn limit(&self, name: &str) -> Option<&RateLimitConfig> {
        self.limits.get(name)
    }

    /// Names of every registered limit.
    pub fn limit_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limits.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A limiter bound to a named limit.
    pub async fn named(&self, name: &str) -> Result<NamedLimiter> {
        let config = self
            .limit(name)
            .cloned()
            .ok_or_else(|| LimiterError::Config(format!("unknown limit '{}'", name)))?;

        Ok(NamedLimiter {
            name: name.to_string(),
            config,
            limiter: self.limiter().await,
            clock: self.clock.clone(),
        })
    }

    /// A limiter bound to a built-in use-case.
    pub async fn for_use_case(&self, use_case: UseCase) -> NamedLimiter {
        let config = self.limits[use_case.name()].clone();
        NamedLimiter {
            name: use_case.name().to_string(),
            config,
            limiter: self.limiter().await,
            clock: self.clock.clone(),
        }
    }

    /// Stop background tasks and close store connections.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(limiter) = self.limiter.get() {
            info!("Shutting down rate limiter");
            limiter.cleanup().await?;
        }
        Ok(())
    }

    async fn build(&self) -> Arc<HybridRateLimiter> {
        let metrics = Arc::new(LimiterMetrics::new());

        let distributed = Arc::new(DistributedRateLimiter::with_clock(
            self.store.clone(),
            self.config.distributed_config(),
            self.clock.clone(),
        ));
        if let Err(err) = distributed.preload().await {
            warn!(error = %err, "Could not preload rate limit script, will load on first check");
        }

        let local = Arc::new(LocalRateLimiter::with_clock(
            self.config.local_config(),
            self.clock.clone(),
        ));
        local.start_sweeper();

        let health = Arc::new(HealthMonitor::new(
            self.store.clone(),
            self.config.health_config(),
            metrics.clone(),
        ));

        let limiter = Arc::new(HybridRateLimiter::new(
            distributed,
            local,
            health,
            metrics,
            self.clock.clone(),
        ));
        limiter.start();

        info!(
            namespace = %self.config.store.namespace,
            "Hybrid rate limiter ready"
        );
        limiter
    }
}

/// The shared limiter bound to one named limit.
#[derive(Clone)]
pub struct NamedLimiter {
    name: String,
    config: RateLimitConfig,
    limiter: Arc<HybridRateLimiter>,
    clock: Arc<dyn Clock>,
}

impl NamedLimiter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `identifier`. Never fails.
    pub async fn check(&self, identifier: &str) -> RateLimitResult {
        match self.limiter.check_limit(identifier, &self.config).await {
            Ok(result) => result,
            Err(err) => {
                warn!(limit = %self.name, error = %err, "Rate limit check failed, failing open");
                RateLimitResult::fail_open(&self.config, self.clock.now_ms())
            }
        }
    }

    /// Forget recorded requests for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        self.limiter.reset(identifier, &self.config).await
    }
}
