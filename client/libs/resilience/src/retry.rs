/// Bounded retry with exponential backoff and optional jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles on every further failure
    pub base_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay to wait after `attempt` (0-based) failed.
    ///
    /// With the default base of one second this is `2^attempt` seconds,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    #[error("Permanent failure on attempt {attempts}: {error}")]
    Permanent { attempts: u32, error: E },
    #[error("Retry policy allows no attempts")]
    NoAttempts,
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
            RetryError::NoAttempts => 0,
        }
    }
}

/// Run `f` until it succeeds or the policy's attempts are used up.
///
/// `f` receives the 0-based attempt number. No delay follows the final attempt.
pub async fn with_backoff<F, Fut, T, E>(policy: &BackoffPolicy, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_backoff_when(policy, |_| true, f).await
}

/// Like [`with_backoff`], but stops early when `is_retryable` rejects an error.
pub async fn with_backoff_when<F, Fut, T, E, R>(
    policy: &BackoffPolicy,
    is_retryable: R,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    if policy.max_attempts == 0 {
        return Err(RetryError::NoAttempts);
    }

    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(attempt = attempt + 1, error = %e, "Permanent failure, not retrying");
                    return Err(RetryError::Permanent {
                        attempts: attempt + 1,
                        error: e,
                    });
                }

                if attempt + 1 >= policy.max_attempts {
                    warn!(
                        attempts = policy.max_attempts,
                        error = %e,
                        "Max attempts reached"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: policy.max_attempts,
                        last_error: e,
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
}
