//! Linear retry policy for handling transient failures.
//!
//! Retry `n` waits `n × unit`, with no cap. The event bus applies it to failing
//! handlers; start-up code (connecting to Postgres or Redis) applies it through
//! [`retry_with_backoff`].
//!
//! # Example
//!
//! ```rust
//! use outflow_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::linear(5, Duration::from_millis(200));
//!
//! let result = retry_with_backoff(policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::BusConfig;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `unit`: 1 second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure
    pub max_retries: u32,
    /// Delay step: retry `n` waits `n × unit`
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

impl From<&BusConfig> for RetryPolicy {
    fn from(config: &BusConfig) -> Self {
        Self::linear(config.max_retries, config.backoff_unit)
    }
}

impl RetryPolicy {
    /// Linear policy: retry `n` waits `n × unit`.
    #[must_use]
    pub const fn linear(max_retries: u32, unit: Duration) -> Self {
        Self { max_retries, unit }
    }

    /// Delay before retry number `retry` (1-based). Retry 0 has no delay.
    #[must_use]
    pub const fn delay_for_retry(&self, retry: u32) -> Duration {
        self.unit.saturating_mul(retry)
    }
}

/// Retry an async operation according to `policy`.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `operation` - Async operation to retry (must be `FnMut` to allow multiple calls)
///
/// # Returns
///
/// Returns `Ok(T)` if the operation succeeds within the retry limit,
/// or the error of the final attempt once all retries are exhausted.
///
/// # Example
///
/// ```rust
/// use outflow_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(policy, || async {
///     // Simulated fallible operation
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry > 0 {
                    tracing::info!(retry, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if retry >= policy.max_retries {
                    tracing::error!(
                        retry,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                retry += 1;
                let delay = policy.delay_for_retry(retry);
                tracing::warn!(
                    retry,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn linear_delay_grows_by_unit() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3));
    }

    #[test]
    fn linear_delay_is_not_capped() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(15));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(45));
        assert_eq!(
            RetryPolicy::linear(100, Duration::from_secs(1)).delay_for_retry(90),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn policy_from_bus_config() {
        let config = BusConfig {
            max_retries: 5,
            backoff_unit: Duration::from_millis(250),
            ..BusConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(5));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("Attempt {attempt} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // 2 failures + 1 success
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(5));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(format!("failure {attempt}"))
            }
        })
        .await;

        // The error of the final attempt is returned
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    proptest::proptest! {
        #[test]
        fn linear_delay_is_retry_times_unit(retry in 1u32..1_000, unit_ms in 1u64..1_000) {
            let policy = RetryPolicy::linear(retry, Duration::from_millis(unit_ms));
            let expected = Duration::from_millis(unit_ms * u64::from(retry));
            proptest::prop_assert_eq!(policy.delay_for_retry(retry), expected);
        }
    }
}
