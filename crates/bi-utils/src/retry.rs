//! Retrying fallible operations.
//!
//! An operation is attempted up to `times` times while it fails with an
//! error the caller considers retryable, then once more with no guard so the
//! last error reaches the caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::info;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Number of guarded attempts before the final one.
    pub times: u32,
    /// Pause after each failed guarded attempt.
    pub sleep: Duration,
}

impl RetryPolicy {
    /// Retry `times` times without sleeping.
    #[must_use]
    pub fn new(times: u32) -> Self {
        Self {
            times,
            sleep: Duration::ZERO,
        }
    }

    /// Sleep between attempts.
    #[must_use]
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }
}

/// Run `op`, retrying on errors for which `is_retryable` returns true.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt.
pub fn retry<T, E, F>(policy: RetryPolicy, is_retryable: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    for attempt in 1..=policy.times {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => {
                log_attempt(&err, attempt, policy.times);
                if !policy.sleep.is_zero() {
                    std::thread::sleep(policy.sleep);
                }
            }
            Err(err) => return Err(err),
        }
    }
    op()
}

/// Async version of [`retry`]; sleeps on the tokio timer.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt.
pub async fn retry_async<T, E, F, Fut>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    for attempt in 1..=policy.times {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => {
                log_attempt(&err, attempt, policy.times);
                if !policy.sleep.is_zero() {
                    tokio::time::sleep(policy.sleep).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    op().await
}

fn log_attempt(err: &impl Display, attempt: u32, times: u32) {
    info!("{err} thrown when trying to run. {attempt}/{times} attempt");
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::Error;

    fn always(_: &Error) -> bool {
        true
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let calls = Cell::new(0);
        let result = retry(RetryPolicy::new(3), always, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::internal("flaky"))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_makes_final_unguarded_attempt() {
        let calls = Cell::new(0);
        let result: Result<(), Error> = retry(RetryPolicy::new(2), always, || {
            calls.set(calls.get() + 1);
            Err(Error::internal("down"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_zero_times_runs_once() {
        let calls = Cell::new(0);
        let result: Result<(), Error> = retry(RetryPolicy::new(0), always, || {
            calls.set(calls.get() + 1);
            Err(Error::internal("down"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_stops_on_non_retryable() {
        let calls = Cell::new(0);
        let result: Result<(), Error> = retry(RetryPolicy::new(5), Error::is_object_store, || {
            calls.set(calls.get() + 1);
            Err(Error::EmptyFrame)
        });
        assert!(matches!(result, Err(Error::EmptyFrame)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_retry_async() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let policy = RetryPolicy::new(2).with_sleep(Duration::from_millis(1));
        let result = retry_async(policy, Error::is_object_store, || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err(Error::object_store("get_object", "key", "timeout"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
