//! Bounded exponential backoff for transient failures.
//!
//! Embedding and vector-store calls share one retry policy: up to three
//! retries starting at 500 ms, doubling each attempt, with ±20% jitter.
//! Only errors that report themselves as recoverable are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Implemented by error types that distinguish transient failures
/// (timeouts, rate limits) from permanent ones (auth, schema mismatch).
pub trait Recoverable {
    fn is_recoverable(&self) -> bool;
}

/// Retry schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Fractional jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Disable retries entirely (used by tests and the in-memory store).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay for the given retry attempt (0-based), jitter applied.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base * (1.0 + spread)).max(0.0))
    }
}

/// Run `op`, retrying recoverable errors according to `policy`.
///
/// The last error is returned once the retry budget is exhausted.
/// Non-recoverable errors propagate immediately.
pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Recoverable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after recoverable error: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
