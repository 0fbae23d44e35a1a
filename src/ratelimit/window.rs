//! Sliding window log for a single key.

use std::collections::VecDeque;

/// Outcome of admitting (or refusing) one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Requests still available in the window after this decision
    pub remaining: u32,
    /// Epoch milliseconds at which capacity frees up
    pub reset_at_ms: u64,
}

/// Admission timestamps of one key, oldest first.
///
/// An entry admitted at `T` is live while `now - window < T`, i.e. it stops
/// counting at exactly `T + window`. This matches the distributed script.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    entries: VecDeque<u64>,
    window_ms: u64,
}

impl SlidingWindow {
    /// Create an empty window log.
    pub fn new(window_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms,
        }
    }

    /// Drop expired entries, then admit or refuse one request at `now_ms`.
    pub fn check(&mut self, now_ms: u64, window_ms: u64, max_requests: u32) -> WindowDecision {
        self.window_ms = window_ms;
        self.trim(now_ms);

        let count = self.entries.len() as u32;
        if count < max_requests {
            self.entries.push_back(now_ms);
            return WindowDecision {
                allowed: true,
                remaining: max_requests - count - 1,
                reset_at_ms: now_ms + window_ms,
            };
        }

        let reset_at_ms = self
            .entries
            .front()
            .map(|oldest| oldest + window_ms)
            .unwrap_or(now_ms + window_ms);

        WindowDecision {
            allowed: false,
            remaining: 0,
            reset_at_ms,
        }
    }

    /// Number of entries still counted at `now_ms`.
    pub fn count(&self, now_ms: u64) -> usize {
        let window_start = now_ms.saturating_sub(self.window_ms);
        self.entries.iter().filter(|&&ts| ts > window_start).count()
    }

    /// Whether every entry has expired by `now_ms`.
    pub fn is_idle(&self, now_ms: u64) -> bool {
        match self.entries.back() {
            Some(newest) => *newest + self.window_ms <= now_ms,
            None => true,
        }
    }

    fn trim(&mut self, now_ms: u64) {
        let window_start = now_ms.saturating_sub(self.window_ms);
        while let Some(&oldest) = self.entries.front() {
            if oldest > window_start {
                break;
            }
            self.entries.pop_front();
        }
    }
}
