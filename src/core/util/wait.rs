use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounds for a poll-until-condition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Attempt budget derived from `timeout / interval`, plus the immediate first check.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let max_attempts = if interval.is_zero() {
            1
        } else {
            let ratio = timeout.as_nanos().div_ceil(interval.as_nanos());
            u32::try_from(ratio).unwrap_or(u32::MAX).saturating_add(1)
        };

        Self {
            interval,
            timeout,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// Budget exhausted without the condition holding
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled { attempts: u32 },
    /// The check itself failed; polling stops immediately
    Failed { attempts: u32, error: E },
}

/// Run `check` immediately and then every `policy.interval` until it yields `Some`.
///
/// Stops on the first error, when the attempt or time budget runs out, or when
/// `cancel` fires. On success returns the value and the number of checks made.
pub async fn poll_until<T, E, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<(T, u32), PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { attempts });
        }

        attempts += 1;
        match check(attempts).await {
            Ok(Some(value)) => return Ok((value, attempts)),
            Ok(None) => {}
            Err(error) => return Err(PollError::Failed { attempts, error }),
        }

        let now = Instant::now();
        if attempts >= policy.max_attempts || now >= deadline {
            return Err(PollError::TimedOut {
                attempts,
                elapsed: now.duration_since(start),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled { attempts }),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
