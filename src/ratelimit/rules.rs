//! Rate limit rules and validated limit configuration.
//!
//! A [`LimitRule`] is the declarative, serde-friendly form found in
//! configuration files. It converts into a [`RateLimitConfig`], which is the
//! validated, immutable value the limiters work with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Time unit for rate limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of requests allowed per window
    pub max_requests: u32,
    /// The window's time unit
    pub unit: TimeUnit,
    /// How many units make up the window
    #[serde(default = "default_units")]
    pub units: u32,
    /// Namespace separating this limit from others sharing an identifier
    pub key_prefix: String,
    /// Policy hook: callers may skip counting successful requests
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Policy hook: callers may skip counting failed requests
    #[serde(default)]
    pub skip_failed_requests: bool,
}

fn default_units() -> u32 {
    1
}

impl LimitRule {
    /// Create a rule of `max_requests` per one `unit`.
    pub fn per(max_requests: u32, unit: TimeUnit, key_prefix: impl Into<String>) -> Self {
        Self {
            max_requests,
            unit,
            units: 1,
            key_prefix: key_prefix.into(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

impl TryFrom<&LimitRule> for RateLimitConfig {
    type Error = LimiterError;

    fn try_from(rule: &LimitRule) -> Result<Self> {
        let window = rule.unit.duration() * rule.units;
        let mut config = RateLimitConfig::new(window, rule.max_requests, rule.key_prefix.clone())?;
        config.skip_successful_requests = rule.skip_successful_requests;
        config.skip_failed_requests = rule.skip_failed_requests;
        Ok(config)
    }
}

/// Validated configuration for one logical limit.
///
/// Built once per use-case at startup and shared freely; it is never
/// mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    window: Duration,
    max_requests: u32,
    key_prefix: String,
    /// Policy hook for callers, not consulted by the counting algorithm
    pub skip_successful_requests: bool,
    /// Policy hook for callers, not consulted by the counting algorithm
    pub skip_failed_requests: bool,
}

impl RateLimitConfig {
    /// Create a configuration, rejecting an empty window or zero quota.
    pub fn new(window: Duration, max_requests: u32, key_prefix: impl Into<String>) -> Result<Self> {
        if window.as_millis() == 0 {
            return Err(LimiterError::Config(
                "window duration must be at least one millisecond".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(LimiterError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window,
            max_requests,
            key_prefix: key_prefix.into(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        })
    }

    /// The sliding window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The sliding window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Maximum admitted requests per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Namespace prepended to identifiers.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}
