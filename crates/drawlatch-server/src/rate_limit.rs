//! Per-caller sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const WINDOW_MS: u64 = 60_000;

/// Admission-timestamp deque per caller, trimmed on every admit. Admin tool
/// calls share the caller's window; there is no exemption.
pub struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admits the request and records its timestamp, or rejects it when the
    /// caller's rolling window is saturated.
    pub fn try_admit(&self, caller_alias: &str, now_unix_ms: u64) -> bool {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(caller_alias.to_string()).or_default();
        while window
            .front()
            .is_some_and(|admitted| now_unix_ms.saturating_sub(*admitted) >= WINDOW_MS)
        {
            window.pop_front();
        }
        if window.len() >= self.per_minute as usize {
            return false;
        }
        window.push_back(now_unix_ms);
        true
    }
}
