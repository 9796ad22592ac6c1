//! Retry utilities with exponential backoff.
//!
//! Each task in a plan carries its own attempt budget, so the retry loop
//! takes the budget from the caller instead of using a global policy.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let result = retry_with_backoff_if(
//!     &RetryConfig::with_max_attempts(3),
//!     "probe hosts",
//!     &cancel,
//!     |e: &keel_common::Error| e.is_retryable(),
//!     || async { probe(&state).await },
//! ).await?;
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Attempts used when a task does not set its own budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Base interval between the first and second attempt
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Same policy with a different attempt budget (0 keeps this one's)
    pub fn attempts(&self, attempts: u32) -> Self {
        Self {
            max_attempts: if attempts == 0 {
                self.max_attempts
            } else {
                attempts
            },
            ..self.clone()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff.
///
/// Retries until success or until `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let never = CancellationToken::new();
    retry_with_backoff_if(config, operation_name, &never, |_| true, operation).await
}

/// Execute an async operation with exponential backoff, giving up early
/// as soon as `should_retry` rejects an error or `cancel` fires.
///
/// # Returns
/// The result of the operation, or the last error once attempts are
/// exhausted, the error is not retryable, or the backoff was cancelled.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed with a non-retryable error"
                    );
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        warn!(operation = %operation_name, attempt = attempt, "Retry cancelled");
                        return Err(e);
                    }
                }
            }
        }
    }
}
