use crate::error::BridgeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, BridgeError>;

/// First reconnect delay after a stream fails.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for the reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Capped exponential backoff: `base * 2^attempt`, never above `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: RECONNECT_BASE_DELAY,
            max: RECONNECT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Poll `check` up to `attempts` times, `interval` apart, until it returns
/// true. Returns whether the condition was met.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=attempts {
        sleep(interval).await;
        if check().await {
            return true;
        }
        debug!("Condition not met after poll {} of {}", attempt, attempts);
    }
    false
}

/// Run `operation` up to `max_attempts` times, `delay_ms` apart, stopping
/// early on success or on an error that isn't recoverable.
pub async fn retry_with_linear_backoff<F, Fut, T>(
    operation: F,
    max_attempts: u32,
    delay_ms: u64,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!("Attempt {} of {}", attempt, max_attempts);

        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_recoverable() || attempt >= max_attempts {
                    return Err(err);
                }

                warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay_ms);
                sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}
