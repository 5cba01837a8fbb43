//! Per-key and global admission control.
//!
//! Three algorithms over lazily created per-key entries: token bucket,
//! sliding window with weighted carry-over, and fixed window. A single
//! second-wide global bucket can cap admissions across all keys. One mutex
//! guards the whole of `allow`/`remaining`/`cleanup`/`stats` so concurrent
//! callers are safe.
//!
//! Time is fractional seconds throughout: a 10/s bucket refills five tokens
//! in 500 ms, not zero.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Entries idle longer than this are reclaimed by `cleanup`.
const ENTRY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

#[derive(Debug)]
struct RateEntry {
    tokens: f64,
    window_count: u64,
    window_start: Instant,
    last_update: Instant,
}

#[derive(Debug, Default)]
struct LimiterInner {
    entries: HashMap<String, RateEntry>,
    allowed: u64,
    denied: u64,
    global_count: u64,
    global_window: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    /// Denials as a percentage of all decisions.
    pub denial_rate: f64,
    pub active_keys: usize,
}

pub struct RateLimiter {
    algorithm: RateLimitAlgorithm,
    /// Sustained admissions per second per key.
    rate: f64,
    /// Token-bucket capacity; also the window length in seconds.
    burst: f64,
    window_size: f64,
    /// Admissions per second across all keys; 0 disables the cap.
    global_limit: u64,
    idle_timeout: Duration,
    epoch: Instant,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(algorithm: RateLimitAlgorithm, rate: f64, burst: f64) -> Self {
        Self {
            algorithm,
            rate,
            burst,
            window_size: burst.floor().max(1.0),
            global_limit: 0,
            idle_timeout: ENTRY_IDLE_TIMEOUT,
            epoch: Instant::now(),
            inner: Mutex::new(LimiterInner::default()),
        }
    }

    pub fn with_global_limit(mut self, limit: u64) -> Self {
        self.global_limit = limit;
        self
    }

    #[cfg(test)]
    fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn locked(&self) -> MutexGuard<'_, LimiterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant or deny one admission for `key`.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.locked();

        if self.global_limit > 0 {
            let second = now.duration_since(self.epoch).as_secs();
            if second != inner.global_window {
                inner.global_window = second;
                inner.global_count = 0;
            }
            if inner.global_count >= self.global_limit {
                inner.denied += 1;
                return false;
            }
        }

        let allowed = {
            let entry = inner
                .entries
                .entry(key.to_string())
                .or_insert_with(|| RateEntry {
                    // Buckets start full.
                    tokens: self.burst,
                    window_count: 0,
                    window_start: now,
                    last_update: now,
                });
            match self.algorithm {
                RateLimitAlgorithm::TokenBucket => {
                    Self::token_bucket(entry, self.rate, self.burst, now)
                }
                RateLimitAlgorithm::SlidingWindow => {
                    Self::sliding_window(entry, self.rate, self.window_size, now)
                }
                RateLimitAlgorithm::FixedWindow => {
                    Self::fixed_window(entry, self.rate, self.window_size, now)
                }
            }
        };

        if allowed {
            inner.allowed += 1;
            inner.global_count += 1;
        } else {
            inner.denied += 1;
        }
        allowed
    }

    fn token_bucket(entry: &mut RateEntry, rate: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(entry.last_update).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * rate).min(burst);
        entry.last_update = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn sliding_window(entry: &mut RateEntry, rate: f64, window_size: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(entry.window_start).as_secs_f64();
        if elapsed >= window_size {
            // Weight the previous window by how much of it still overlaps;
            // clamped so a long-idle entry starts clean.
            let weight = (1.0 - (elapsed - window_size) / window_size).clamp(0.0, 1.0);
            entry.window_count = (entry.window_count as f64 * weight) as u64;
            entry.window_start = now;
        }
        entry.last_update = now;

        if (entry.window_count as f64) < rate * window_size {
            entry.window_count += 1;
            true
        } else {
            false
        }
    }

    fn fixed_window(entry: &mut RateEntry, rate: f64, window_size: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(entry.window_start).as_secs_f64();
        if elapsed >= window_size {
            entry.window_count = 0;
            entry.window_start = now;
        }
        entry.last_update = now;

        if (entry.window_count as f64) < rate * window_size {
            entry.window_count += 1;
            true
        } else {
            false
        }
    }

    /// Unconsumed quota for a key; a key never seen has its full quota.
    pub fn remaining(&self, key: &str) -> f64 {
        let inner = self.locked();
        match (self.algorithm, inner.entries.get(key)) {
            (RateLimitAlgorithm::TokenBucket, Some(e)) => e.tokens,
            (RateLimitAlgorithm::TokenBucket, None) => self.burst,
            (_, Some(e)) => self.rate * self.window_size - e.window_count as f64,
            (_, None) => self.rate * self.window_size,
        }
    }

    /// Reclaim entries idle beyond the threshold; returns how many.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.locked();
        let before = inner.entries.len();
        let idle = self.idle_timeout;
        inner
            .entries
            .retain(|_, e| now.duration_since(e.last_update) <= idle);
        before - inner.entries.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let inner = self.locked();
        let total = inner.allowed + inner.denied;
        RateLimiterStats {
            allowed: inner.allowed,
            denied: inner.denied,
            denial_rate: if total > 0 {
                inner.denied as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            active_keys: inner.entries.len(),
        }
    }
}
