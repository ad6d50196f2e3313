use super::{StateError, StateResult, retry_if_possible};

use std::{fmt::Display, time::Duration};

use tracing::{debug, error, info};

/// How often and how patiently a transaction is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u8,
    /// Delay before the first retry. The n-th retry waits n times as long.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NONE: Self = Self {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    /// Creates a [`RetryPolicy`].
    pub const fn new(max_retries: u8, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// The longest a transaction can take under this policy if each attempt is bounded by
    /// `attempt_timeout`: every attempt timing out, plus every backoff sleep in between.
    pub fn budget(&self, attempt_timeout: Duration) -> Duration {
        let retries = u32::from(self.max_retries);
        let backoff_steps = retries * (retries + 1) / 2;

        attempt_timeout
            .saturating_mul(retries + 1)
            .saturating_add(self.backoff.saturating_mul(backoff_steps))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Runs a transaction until it succeeds, fails with [`StateError::Stop`], or the retry budget of
/// `policy` is spent.
///
/// `name` only distinguishes transactions in logs.
///
/// # Errors
///
/// Returns the error of the last attempt if the transaction never succeeds.
pub async fn run_with_retries<T, E, F, Fut>(name: &str, policy: RetryPolicy, mut f: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = StateResult<T, E>>,
{
    let mut retry: u8 = 0;

    loop {
        match f().await {
            Ok(value) => {
                if retry > 0 {
                    info!("transaction {name} succeed after {retry} retries!");
                }
                return Ok(value);
            }
            Err(StateError::Retry(err)) => {
                if retry_if_possible(&mut retry, policy.max_retries) {
                    debug!("transaction {name} failed transiently: {err}");
                    tokio::time::sleep(policy.backoff * u32::from(retry)).await;
                    continue;
                }
                error!("transaction {name} failed: {err}");
                return Err(err);
            }
            Err(StateError::Stop(err)) => {
                debug!("transaction {name} stopped: {err}");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU8, Ordering};

    #[test]
    fn budget_covers_every_attempt_and_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        // 4 attempts of 10s, then sleeps of 0.5s, 1s and 1.5s
        assert_eq!(policy.budget(Duration::from_secs(10)), Duration::from_secs(43));
        assert_eq!(
            RetryPolicy::NONE.budget(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            RetryPolicy::new(u8::MAX, Duration::MAX).budget(Duration::MAX),
            Duration::MAX
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let attempts = &AtomicU8::new(0);
        let result: Result<&str, String> =
            run_with_retries("flaky", RetryPolicy::new(3, Duration::ZERO), move || async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(StateError::Retry(String::from("connection reset"))),
                    _ => Ok("done"),
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_stop_at_once() {
        let attempts = &AtomicU8::new(0);
        let result: Result<(), String> = run_with_retries("broken", RetryPolicy::default(), move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StateError::Stop(String::from("404 Not Found")))
        })
        .await;

        assert_eq!(result, Err(String::from("404 Not Found")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_when_the_budget_is_spent() {
        let attempts = &AtomicU8::new(0);
        let result: Result<(), String> =
            run_with_retries("down", RetryPolicy::new(2, Duration::ZERO), move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StateError::Retry(String::from("503 Service Unavailable")))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
