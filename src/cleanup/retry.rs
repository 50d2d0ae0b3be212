//! Bounded fixed-delay retry for whole cleanup runs.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// How often and how patiently a failed run is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Fixed delay before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(60),
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted, awaiting
/// `sleep(policy.delay)` between attempts.
///
/// Production callers pass `tokio::time::sleep`.
///
/// # Errors
///
/// Returns the error from the last attempt.
pub async fn retry_with<T, E, Op, OpFut, Sleep, SleepFut>(
    policy: &RetryPolicy,
    mut op: Op,
    mut sleep: Sleep,
) -> Result<T, E>
where
    E: Display,
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Sleep: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_secs = policy.delay.as_secs(),
                    error = %e,
                    "Cleanup attempt failed; retrying"
                );
                sleep(policy.delay).await;
            }
            Err(e) => {
                error!(
                    attempts = attempt + 1,
                    error = %e,
                    "Cleanup failed; retries exhausted"
                );
                return Err(e);
            }
        }
    }
}
