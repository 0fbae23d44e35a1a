//! Rate limiter trait for abstracting local, distributed and hybrid implementations.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::rules::RateLimitConfig;
use crate::error::Result;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The configured quota
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When capacity frees up again
    pub reset_at: DateTime<Utc>,
    /// Seconds until `reset_at`, only set when the request was refused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// Build a result from raw window arithmetic in epoch milliseconds.
    pub fn from_window(
        allowed: bool,
        limit: u32,
        remaining: u32,
        reset_at_ms: u64,
        now_ms: u64,
    ) -> Self {
        let retry_after = if allowed {
            None
        } else {
            Some(reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1))
        };

        Self {
            allowed,
            limit,
            remaining: if allowed { remaining.min(limit) } else { 0 },
            reset_at: millis_to_datetime(reset_at_ms),
            retry_after,
        }
    }

    /// An admitting result used when no backend could decide.
    pub fn fail_open(config: &RateLimitConfig, now_ms: u64) -> Self {
        let limit = config.max_requests();
        Self::from_window(true, limit, limit, now_ms + config.window_ms(), now_ms)
    }

    /// HTTP headers describing this result.
    ///
    /// Callers translate a refused check into a 429 carrying these.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Trait for rate limiter implementations.
///
/// Local, distributed and hybrid limiters all satisfy this contract, so
/// application code can hold any of them behind `Arc<dyn RateLimiterBackend>`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `identifier` under `config` and decide on it.
    async fn check_limit(&self, identifier: &str, config: &RateLimitConfig)
        -> Result<RateLimitResult>;

    /// Forget all recorded requests for `identifier` under `config`.
    async fn reset(&self, identifier: &str, config: &RateLimitConfig) -> Result<()>;

    /// Forget every key whose logical name (`key_prefix + identifier`)
    /// matches the glob `pattern`. Returns how many keys were removed.
    async fn reset_pattern(&self, pattern: &str) -> Result<u64>;

    /// Whether the backend can currently serve checks.
    async fn health_check(&self) -> bool;

    /// Stop background work and release resources.
    async fn cleanup(&self) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_allowed_result_has_no_retry_after() {
        let result = RateLimitResult::from_window(true, 10, 9, 61_000, 1_000);
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.retry_after, None);
        assert_eq!(result.reset_at.timestamp_millis(), 61_000);
    }

    #[test]
    fn test_denied_result_rounds_retry_after_up() {
        let result = RateLimitResult::from_window(false, 10, 0, 2_001, 1_000);
        assert_eq!(result.retry_after, Some(2));

        let result = RateLimitResult::from_window(false, 10, 0, 1_001, 1_000);
        assert_eq!(result.retry_after, Some(1));
    }

    #[test]
    fn test_result_serializes_to_json() {
        let allowed = serde_json::to_value(RateLimitResult::from_window(true, 10, 9, 61_000, 1_000)).unwrap();
        assert_eq!(allowed["allowed"], true);
        assert_eq!(allowed["remaining"], 9);
        assert!(allowed["reset_at"]
            .as_str()
            .unwrap()
            .starts_with("1970-01-01T00:01:01"));
        assert!(allowed.get("retry_after").is_none());

        let denied = serde_json::to_value(RateLimitResult::from_window(false, 10, 0, 2_001, 1_000)).unwrap();
        assert_eq!(denied["retry_after"], 2);
    }

    #[test]
    fn test_denied_result_zeroes_remaining() {
        let result = RateLimitResult::from_window(false, 10, 7, 5_000, 1_000);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_fail_open_admits() {
        let config = RateLimitConfig::new(Duration::from_secs(60), 5, "x:").unwrap();
        let result = RateLimitResult::fail_open(&config, 1_000);
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);
        assert_eq!(result.reset_at.timestamp_millis(), 61_000);
    }

    #[test]
    fn test_headers() {
        let result = RateLimitResult::from_window(false, 3, 0, 10_000, 1_000);
        let headers = result.headers();
        assert_eq!(headers[0], ("X-RateLimit-Limit", "3".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "0".to_string()));
        assert_eq!(headers[2], ("X-RateLimit-Reset", "10".to_string()));
        assert_eq!(headers[3], ("Retry-After", "9".to_string()));

        let allowed = RateLimitResult::from_window(true, 3, 2, 10_000, 1_000);
        assert_eq!(allowed.headers().len(), 3);
    }
}
