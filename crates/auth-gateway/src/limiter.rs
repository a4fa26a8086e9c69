//! Sliding one-minute window admission control per key id.
//!
//! Each key keeps the instants of its admitted requests from the trailing
//! 60 seconds. A request is admitted if fewer than `limit` such instants remain
//! after dropping the stale ones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::clock::Clock;
use crate::throttle::Ratelimit;

pub const WINDOW: Duration = Duration::from_secs(60);

pub struct SlidingWindowLimiter {
    policy: Arc<dyn Ratelimit>,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: Arc<dyn Ratelimit>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Admit or reject one request for `key_id`, recording it when admitted.
    pub fn allow(&self, key_id: &str) -> bool {
        let limit = self.policy.limit_for_key(key_id);
        if limit.is_unlimited() {
            return true;
        }

        let now = self.clock.now();
        // Purge, check and append under one entry guard.
        let mut window = self.windows.entry(key_id.to_string()).or_default();
        if let Some(cutoff) = now.checked_sub(WINDOW) {
            while window.front().is_some_and(|&t| t < cutoff) {
                window.pop_front();
            }
        }

        if window.len() >= limit.per_minute as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop windows whose admissions have all left the trailing minute.
    /// Returns how many keys were dropped.
    pub fn evict_idle(&self) -> usize {
        let Some(cutoff) = self.clock.now().checked_sub(WINDOW) else {
            return 0;
        };
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.back().is_some_and(|&t| t >= cutoff));
        before.saturating_sub(self.windows.len())
    }

    /// Keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    #[cfg(test)]
    fn window_len(&self, key_id: &str) -> usize {
        self.windows.get(key_id).map_or(0, |w| w.len())
    }
}
