//! Retry logic with exponential backoff for handling transient failures.
//!
//! Retries are bounded by total elapsed time rather than by attempt count: the
//! multiplier grows the delay without limit (up to `max_delay` per sleep), and
//! once the next sleep would carry the operation past `max_elapsed_time` the
//! last error is returned. Sleeps observe a [`CancellationToken`] so shutdown is
//! never held up by a long retry budget.
//!
//! # Example
//!
//! ```rust
//! use user_service_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .max_elapsed_time(Duration::from_secs(120))
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! let result = retry_with_backoff(&policy, &cancel, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Exponent cap; beyond this every multiplier > 1 has long since hit `max_delay`.
const MAX_EXPONENT: i32 = 64;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `initial_delay`: 500ms
/// - `max_delay`: 60 seconds
/// - `multiplier`: 1.5
/// - `randomization_factor`: 0.5 (each sleep is drawn from `delay * [0.5, 1.5]`)
/// - `max_elapsed_time`: 120 seconds
/// - `max_retries`: unlimited
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Relative jitter applied to every delay, in `[0, 1]`
    pub randomization_factor: f64,
    /// Total time budget across all attempts; `None` retries forever
    pub max_elapsed_time: Option<Duration>,
    /// Optional hard cap on retries in addition to the time budget
    pub max_retries: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            randomization_factor: None,
            max_elapsed_time: None,
            unbounded: false,
            max_retries: None,
        }
    }

    /// Calculate the un-jittered delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ attempt),
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(MAX_EXPONENT).min(MAX_EXPONENT);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Apply the randomization factor to `delay`.
    fn jittered(&self, delay: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        delay.mul_f64(scale)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    randomization_factor: Option<f64>,
    max_elapsed_time: Option<Duration>,
    unbounded: bool,
    max_retries: Option<usize>,
}

impl RetryPolicyBuilder {
    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set relative jitter (0 disables jitter).
    #[must_use]
    pub const fn randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = Some(factor);
        self
    }

    /// Set the total elapsed-time budget.
    #[must_use]
    pub const fn max_elapsed_time(mut self, budget: Duration) -> Self {
        self.max_elapsed_time = Some(budget);
        self.unbounded = false;
        self
    }

    /// Retry until success or cancellation.
    #[must_use]
    pub const fn unbounded(mut self) -> Self {
        self.max_elapsed_time = None;
        self.unbounded = true;
        self
    }

    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let max_elapsed_time = if self.unbounded {
            None
        } else {
            Some(self.max_elapsed_time.unwrap_or(Duration::from_secs(120)))
        };
        RetryPolicy {
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(500)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(60)),
            multiplier: self.multiplier.unwrap_or(1.5),
            randomization_factor: self.randomization_factor.unwrap_or(0.5),
            max_elapsed_time,
            max_retries: self.max_retries,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    /// The elapsed-time budget (or retry cap) ran out.
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: usize,
        /// Time spent
        elapsed: Duration,
        /// Error of the final attempt
        last_error: E,
    },

    /// Cancellation was requested between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made
        attempts: usize,
        /// Error of the final attempt, if one ran
        last_error: Option<E>,
    },
}

impl<E: fmt::Display> RetryError<E> {
    /// `true` if the retry loop stopped because of cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Retry an async operation with exponential backoff.
///
/// The operation is attempted at least once unless `cancel` is already
/// triggered. After each failure the next delay is computed; if sleeping it
/// would exceed the elapsed-time budget, the last error is returned as
/// [`RetryError::Exhausted`].
///
/// # Errors
///
/// [`RetryError::Exhausted`] when the budget runs out,
/// [`RetryError::Cancelled`] when `cancel` fires before a retry.
///
/// # Example
///
/// ```rust
/// use user_service_runtime::retry::{RetryPolicy, retry_with_backoff};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = RetryPolicy::default();
/// let cancel = CancellationToken::new();
///
/// let result = retry_with_backoff(&policy, &cancel, || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last_error: None,
            });
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                let attempts = attempt + 1;
                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                let elapsed = started.elapsed();

                let over_budget = policy
                    .max_elapsed_time
                    .is_some_and(|budget| elapsed + delay > budget);
                let over_cap = policy.max_retries.is_some_and(|cap| attempt >= cap);

                if over_budget || over_cap {
                    tracing::error!(
                        attempts,
                        elapsed_ms = elapsed.as_millis(),
                        error = %err,
                        "Operation failed, retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts,
                        elapsed,
                        last_error: err,
                    });
                }

                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(RetryError::Cancelled {
                            attempts,
                            last_error: Some(err),
                        });
                    }
                    () = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
