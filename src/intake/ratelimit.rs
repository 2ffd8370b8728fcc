//! Per-remote-address token bucket for the webhook endpoint (spec §4.3).
//! A small in-process structure, consistent with this crate avoiding a new
//! heavyweight dependency for a concern a rate-limited REST client would
//! otherwise hand-roll anyway.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);
const CAPACITY: u32 = 1000;

struct Bucket {
    tokens: u32,
    window_started_at: Instant,
}

pub struct TokenBucketLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    capacity: u32,
    window: Duration,
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(CAPACITY, WINDOW)
    }
}

impl TokenBucketLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            window,
        }
    }

    /// Returns `true` if the caller is within budget for this window.
    pub fn check(&self, key: &str) -> bool {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.capacity,
                    window_started_at: Instant::now(),
                })
            });
        let mut bucket = entry.lock().unwrap();
        if bucket.window_started_at.elapsed() >= self.window {
            bucket.tokens = self.capacity;
            bucket.window_started_at = Instant::now();
        }
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = TokenBucketLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn tracks_separate_buckets_per_key() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }
}
