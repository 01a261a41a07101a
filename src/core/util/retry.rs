use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::errors::AppError;

/// How often and how fast to retry a write rejected with a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(10),
        }
    }
}

/// Run `op` until it succeeds, fails with something other than `Conflict`,
/// or the attempt budget is spent.
///
/// `op` receives the 1-based attempt number; attempts after the first must
/// re-read the object so the write carries the latest resource version.
pub async fn retry_on_conflict<T, F, Fut>(policy: ConflictRetry, mut op: F) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Err(AppError::Conflict(msg)) if attempt < attempts => {
                debug!(attempt, %msg, "Write conflicted, retrying with fresh object");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
