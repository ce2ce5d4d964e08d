//! Retry rate limiters
//!
//! A [`RateLimiter`] decides how long a failing key waits before it is
//! delivered again. Limiters keep their own per-key failure counts, which is
//! what the work queue reports as `num_requeues`.

use core_runtime::config::RateLimiterConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::key::ObjectKey;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again. Counts as one failure.
    fn when(&self, key: &ObjectKey) -> Duration;

    /// Stop tracking `key`
    fn forget(&self, key: &ObjectKey);

    /// Failures recorded for `key` since it was last forgotten
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

// ============================================================================
// Per-item exponential backoff
// ============================================================================

/// `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ItemExponentialFailureRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        match 2u32
            .checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
        {
            Some(backoff) if backoff < self.max => backoff,
            _ => self.max,
        }
    }

    fn forget(&self, key: &ObjectKey) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// ============================================================================
// Overall token bucket
// ============================================================================

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys
///
/// Bounds the overall retry rate to `qps` with bursts of up to `burst`.
/// Reservations are never cancelled, so a burst of failures is spread out
/// over time.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-bucket.tokens / self.qps)
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

impl std::fmt::Debug for BucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRateLimiter")
            .field("qps", &self.qps)
            .field("burst", &self.burst)
            .finish()
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Worst case of several limiters
pub struct MaxOfRateLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        // Every limiter records the failure, not just the slowest one
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &ObjectKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Exponential per-item backoff (5ms..1000s) combined with an overall
/// 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    controller_rate_limiter(&RateLimiterConfig::default())
}

pub fn controller_rate_limiter(config: &RateLimiterConfig) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Arc::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay(),
            config.max_delay(),
        )),
        Arc::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
