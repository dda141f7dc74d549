//! Fixed-window rate limiting keyed by `(action, user)`.
//!
//! Counters live in a concurrent map; a periodic sweep drops windows that
//! ended. HTTP callers map a miss to 429, socket callers to an `error` ack.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-action limits. The two instances the node uses:
/// uploads (30/60 s) and voice joins (10/60 s).
#[derive(Debug, Clone, Copy)]
pub struct Limit {
    pub max: u32,
    pub window: Duration,
}

impl Limit {
    pub const UPLOAD: Limit = Limit { max: 30, window: Duration::from_secs(60) };
    pub const VOICE_JOIN: Limit = Limit { max: 10, window: Duration::from_secs(60) };
}

#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: std::sync::Arc<DashMap<(String, String), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one hit; returns false when the window is exhausted.
    pub fn check(&self, action: &str, user_id: &str, limit: Limit) -> bool {
        let key = (action.to_string(), user_id.to_string());
        let now = Instant::now();
        let mut entry = self.windows.entry(key).or_insert(Window { started: now, count: 0 });

        if now.duration_since(entry.started) >= limit.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= limit.max {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop windows idle longer than `max_idle`.
    pub fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, w| now.duration_since(w.started) < max_idle);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.windows.len()
    }
}
