//! Rate limiting logic and state management.

mod backend;
mod clock;
mod distributed;
mod factory;
mod health;
mod hybrid;
mod key;
mod local;
mod metrics;
mod rules;
mod script;
mod window;

pub use backend::{RateLimitResult, RateLimiterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedConfig, DistributedRateLimiter};
pub use factory::{LimiterFactory, NamedLimiter, UseCase};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot, HealthState};
pub use hybrid::HybridRateLimiter;
pub use key::{glob_match, KeyPattern, WindowKey};
pub use local::{LocalConfig, LocalRateLimiter};
pub use metrics::{LimiterMetrics, MetricsSnapshot, ServedBy};
pub use rules::{LimitRule, RateLimitConfig, TimeUnit};
pub use script::{ScriptState, SLIDING_WINDOW_SCRIPT};
pub use window::SlidingWindow;
