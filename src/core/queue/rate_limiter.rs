use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Decides how long an item must wait before it is re-queued.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`. Calling this records a failure.
    fn when(&self, item: &T) -> Duration;

    /// Drop all retry history for `item`.
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Hash + Eq + Clone> ItemExponentialFailureRateLimiter<T> {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<T: Hash + Eq + Clone> Default for ItemExponentialFailureRateLimiter<T> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_DELAY, Self::DEFAULT_MAX_DELAY)
    }
}

impl<T: Hash + Eq + Clone + Send> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // Compute in f64 so large exponents saturate instead of overflowing
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !backoff.is_finite() || backoff > self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

/// Overall token bucket shared by all items.
/// Allows bursts up to `burst`, then limits to `qps`.
pub struct BucketRateLimiter {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl BucketRateLimiter {
    pub const DEFAULT_QPS: f64 = 10.0;
    pub const DEFAULT_BURST: u32 = 100;

    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            qps,
            burst: burst as f64,
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QPS, Self::DEFAULT_BURST)
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        // Reserve a token; a negative balance is the wait until it is repaid
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-bucket.tokens / self.qps)
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines several limiters and waits for the slowest one.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff (5ms .. 1000s) combined with a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Hash + Eq + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::<T>::default()),
        Box::new(BucketRateLimiter::default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_non_decreasing_up_to_cap() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        let key = "ns/web-1".to_string();

        let delays: Vec<Duration> = (0..20).map(|_| limiter.when(&key)).collect();

        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&key), 20);
    }

    #[test]
    fn test_forget_resets_to_base_delay() {
        let limiter = ItemExponentialFailureRateLimiter::<String>::default();
        let key = "ns/web-1".to_string();

        limiter.when(&key);
        limiter.when(&key);
        limiter.forget(&key);

        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_is_tracked_per_key() {
        let limiter = ItemExponentialFailureRateLimiter::<String>::default();
        let a = "ns/a".to_string();
        let b = "ns/b".to_string();

        limiter.when(&a);
        limiter.when(&a);

        assert_eq!(limiter.when(&b), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&a), 2);
    }

    #[test]
    fn test_huge_failure_count_saturates_at_max() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let key = 1u32;
        for _ in 0..2000 {
            limiter.when(&key);
        }
        assert_eq!(limiter.when(&key), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &2), Duration::ZERO);

        let wait = RateLimiter::<u32>::when(&limiter, &3);
        assert!(wait > Duration::from_millis(90) && wait <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_picks_slowest_limiter() {
        let limiter = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_secs(2),
                Duration::from_secs(60),
            )),
            Box::new(BucketRateLimiter::default()),
        ]);
        let key = "ns/web-1".to_string();

        assert_eq!(limiter.when(&key), Duration::from_secs(2));
        assert_eq!(limiter.when(&key), Duration::from_secs(4));
        assert_eq!(limiter.num_requeues(&key), 2);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
