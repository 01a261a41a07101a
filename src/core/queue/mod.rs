// Dedup work queue with per-key backoff, feeding the pod controller workers
pub mod rate_limiter;
pub mod rate_limiting_queue;
pub mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting_queue::RateLimitingQueue;
pub use work_queue::WorkQueue;
