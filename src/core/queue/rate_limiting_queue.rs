use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::core::queue::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use crate::core::queue::work_queue::WorkQueue;

/// Work queue with delayed and rate-limited re-adds.
pub struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new(limiter: Arc<dyn RateLimiter<T>>) -> Self {
        Self {
            queue: WorkQueue::new(),
            limiter,
        }
    }

    /// Queue backed by `default_controller_rate_limiter`.
    pub fn with_default_limiter() -> Self {
        Self::new(Arc::new(default_controller_rate_limiter()))
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    /// Add `item` once `delay` has elapsed. Dropped if the queue shuts down first.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }

        trace!(?item, ?delay, "Delaying re-add");
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Re-add `item` after the limiter's backoff for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Reset the backoff for `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
