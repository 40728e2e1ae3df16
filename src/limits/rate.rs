use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-key fixed-window request counter.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Inner>,
    sweep_interval: Duration,
}

#[derive(Debug)]
struct Inner {
    buckets: HashMap<String, Bucket>,
    last_sweep: Instant,
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    resets_at: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval,
        }
    }

    /// Counts a request for `key` and reports whether it is within `limit`
    /// for the current window. Invalid arguments always allow.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        if key.is_empty() || limit == 0 || window.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut inner = self.lock();

        if now.duration_since(inner.last_sweep) >= self.sweep_interval {
            inner.buckets.retain(|_, bucket| bucket.resets_at > now);
            inner.last_sweep = now;
        }

        match inner.buckets.get_mut(key) {
            Some(bucket) if bucket.resets_at > now => {
                if bucket.count >= limit {
                    return false;
                }
                bucket.count += 1;
                true
            }
            Some(bucket) => {
                bucket.count = 1;
                bucket.resets_at = now + window;
                true
            }
            None => {
                inner.buckets.insert(
                    key.to_string(),
                    Bucket {
                        count: 1,
                        resets_at: now + window,
                    },
                );
                true
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.buckets.clear();
        inner.last_sweep = Instant::now();
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.lock().buckets.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
