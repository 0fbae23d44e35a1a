//! The atomic sliding-window script and its load state.

/// Sliding-window-log admission, executed atomically by the store.
///
/// `KEYS[1]` is the window key. `ARGV` is `now_ms`, `window_ms`,
/// `max_requests` and a unique member. Replies with
/// `{allowed, remaining, reset_at_ms, retry_after_secs}`.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return {1, limit - count - 1, now + window, 0}
end

local reset_at = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset_at = tonumber(oldest[2]) + window
end
return {0, 0, reset_at, math.ceil((reset_at - now) / 1000)}
"#;

/// Whether the store currently holds the script under a known reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScriptState {
    /// The reference must be (re)uploaded before by-reference execution.
    #[default]
    NotLoaded,
    /// The store returned this reference on upload.
    Loaded { sha: String },
}

impl ScriptState {
    /// The cached reference, if any.
    pub fn sha(&self) -> Option<&str> {
        match self {
            ScriptState::Loaded { sha } => Some(sha),
            ScriptState::NotLoaded => None,
        }
    }
}

/// Reply of one script execution, validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at_ms: u64,
    pub retry_after_secs: u64,
}

impl ScriptReply {
    /// Validate a raw reply against the limit it was computed for.
    ///
    /// Returns a description of the problem for replies the script cannot
    /// produce.
    pub fn parse(raw: &[i64], max_requests: u32, now_ms: u64) -> Result<Self, String> {
        let [allowed, remaining, reset_at, retry_after] = raw else {
            return Err(format!("expected 4 integers, got {:?}", raw));
        };

        let allowed = match allowed {
            0 => false,
            1 => true,
            other => return Err(format!("invalid admission flag {}", other)),
        };
        if *remaining < 0 || *remaining > i64::from(max_requests) {
            return Err(format!(
                "remaining {} outside 0..={}",
                remaining, max_requests
            ));
        }
        if *reset_at < 0 || *retry_after < 0 {
            return Err(format!("negative timing in reply {:?}", raw));
        }
        let reset_at_ms = *reset_at as u64;
        if !allowed && reset_at_ms <= now_ms {
            return Err(format!(
                "refused with reset {} not after now {}",
                reset_at_ms, now_ms
            ));
        }
        if !allowed && *retry_after < 1 {
            return Err(format!("refused without a retry delay: {:?}", raw));
        }

        Ok(Self {
            allowed,
            remaining: *remaining as u32,
            reset_at_ms,
            retry_after_secs: *retry_after as u64,
        })
    }
}
