//! Work queues
//!
//! Three layers, each wrapping the previous one:
//! - [`WorkQueue`]: deduplicating FIFO with processing/dirty tracking
//! - [`DelayingQueue`]: adds `add_after`
//! - [`RateLimitingQueue`]: adds `add_rate_limited`, `forget` and `num_requeues`

pub mod delaying;
pub mod rate_limiter;
pub mod rate_limiting;
pub mod workqueue;

pub use delaying::DelayingQueue;
pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::{QueueStats, RateLimitingQueue};
pub use workqueue::WorkQueue;
