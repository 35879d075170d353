// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sliding-window rate limiters keyed by device (spec §4.1, §4.6: pair,
//! auth, and per-message rates).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A sliding-window limiter: at most `max` events per `window` per key.
/// Each key tracks its own timestamp ring; keys are swept periodically so
/// idle devices don't accumulate memory forever.
pub struct SlidingWindowLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
    attempts_since_sweep: Mutex<u64>,
}

const SWEEP_EVERY: u64 = 1000;

impl SlidingWindowLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window, hits: Mutex::new(HashMap::new()), attempts_since_sweep: Mutex::new(0) }
    }

    /// Record an attempt for `key` at `now`, returning `true` if it's
    /// within the window's budget and `false` if the limiter is exhausted.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        self.maybe_sweep(now);

        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hits.entry(key.to_owned()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() as u32 >= self.max {
            return false;
        }

        entry.push(now);
        true
    }

    /// Current count within the window for `key`, without recording a
    /// new attempt (used for `pending.size + (new?1:0) > maxPendingRequests`
    /// style checks against a non-time-windowed cap).
    pub fn count(&self, key: &str, now: Instant) -> u32 {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hits.entry(key.to_owned()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        entry.len() as u32
    }

    fn maybe_sweep(&self, now: Instant) {
        let mut attempts = self.attempts_since_sweep.lock().unwrap_or_else(|e| e.into_inner());
        *attempts += 1;
        if *attempts < SWEEP_EVERY {
            return;
        }
        *attempts = 0;
        drop(attempts);

        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < self.window);
            !timestamps.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_blocks() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check("dev-1", now));
        assert!(limiter.check("dev-1", now));
        assert!(!limiter.check("dev-1", now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check("dev-1", now));
        assert!(limiter.check("dev-2", now));
    }

    #[test]
    fn window_expiry_frees_budget() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(10));
        let now = Instant::now();
        assert!(limiter.check("dev-1", now));
        assert!(!limiter.check("dev-1", now));
        let later = now + Duration::from_millis(20);
        assert!(limiter.check("dev-1", later));
    }
}
