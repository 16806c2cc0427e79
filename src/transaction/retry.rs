//! Retry policy.
//!
//! A failed attempt is either retried after a backoff or returned unchanged.
//! Which failures are retriable depends on the kind of work, so the caller
//! passes the predicate along with the work.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::TransactionError;

/// Attempt bound and backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    pub fn base_delay_ms(mut self, value: u64) -> Self {
        self.base_delay_ms = value;
        self
    }

    pub fn max_delay_ms(mut self, value: u64) -> Self {
        self.max_delay_ms = value;
        self
    }

    /// Wait before attempt `attempt + 1`: doubles per attempt, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// What to do with one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { wait: Duration },
    Fatal,
}

/// Blocks the calling thread between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSleeper;

impl Sleeper for SystemSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested waits without sleeping.
#[derive(Debug, Default)]
pub struct FakeSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Sleeper for FakeSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

/// Failures of a whole transaction: store conflicts and transient errors.
pub fn is_failed_txn_retriable(error: &TransactionError) -> bool {
    error.is_retriable_conflict()
}

/// Failures of plain queries: transient store errors only.
pub fn is_failed_query_retriable(error: &TransactionError) -> bool {
    error.is_transient()
}

/// Read-only work can fail either way.
pub fn is_failed_read_retriable(error: &TransactionError) -> bool {
    is_failed_txn_retriable(error) || is_failed_query_retriable(error)
}

/// Re-runs work on retriable failures, up to the configured bound.
#[derive(Clone)]
pub struct Retrier {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl Retrier {
    pub fn new(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classify the failure of attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32, retriable: bool) -> RetryDecision {
        if retriable && attempt < self.config.max_attempts.max(1) {
            RetryDecision::Retry {
                wait: self.config.delay_after(attempt),
            }
        } else {
            RetryDecision::Fatal
        }
    }

    /// Run `f` until it succeeds, fails fatally, or runs out of attempts.
    /// The last failure is returned as is.
    pub fn call_with_retry<T, E, F, P>(&self, mut f: F, is_retriable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            let error = match f() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.decide(attempt, is_retriable(&error)) {
                RetryDecision::Retry { wait } => {
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    self.sleeper.sleep(wait);
                    attempt += 1;
                }
                RetryDecision::Fatal => return Err(error),
            }
        }
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    fn retrier(max_attempts: u32) -> (Arc<FakeSleeper>, Retrier) {
        let sleeper = Arc::new(FakeSleeper::new());
        let config = RetryConfig::default().max_attempts(max_attempts);
        (sleeper.clone(), Retrier::new(config, sleeper))
    }

    fn conflict() -> TransactionError {
        StorageError::ConcurrentModification {
            branch: "main".into(),
        }
        .into()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(5), Duration::from_millis(1600));
        assert_eq!(config.delay_after(6), Duration::from_millis(2000));
        assert_eq!(config.delay_after(100), Duration::from_millis(2000));
    }

    #[test]
    fn test_retriable_failure_exhausts_bound() {
        let (sleeper, retrier) = retrier(3);
        let mut attempts = 0;

        let result: Result<(), _> = retrier.call_with_retry(
            || {
                attempts += 1;
                Err(conflict())
            },
            is_failed_txn_retriable,
        );

        assert!(result.unwrap_err().is_retriable_conflict());
        assert_eq!(attempts, 3);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
    }

    #[test]
    fn test_fatal_failure_short_circuits() {
        let (sleeper, retrier) = retrier(3);
        let mut attempts = 0;

        let result: Result<(), _> = retrier.call_with_retry(
            || {
                attempts += 1;
                Err(TransactionError::NotFound("x".into()))
            },
            is_failed_txn_retriable,
        );

        assert!(matches!(result, Err(TransactionError::NotFound(_))));
        assert_eq!(attempts, 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn test_succeeds_after_transient_failure() {
        let (_sleeper, retrier) = retrier(3);
        let mut attempts = 0;

        let result = retrier.call_with_retry(
            || {
                attempts += 1;
                if attempts < 2 {
                    Err(conflict())
                } else {
                    Ok(attempts)
                }
            },
            is_failed_txn_retriable,
        );
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_query_predicate_ignores_conflicts() {
        assert!(!is_failed_query_retriable(&conflict()));
        assert!(is_failed_read_retriable(&conflict()));
        assert!(!is_failed_read_retriable(&TransactionError::NotInTransaction));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let (_sleeper, retrier) = retrier(0);
        let mut attempts = 0;
        let _: Result<(), _> = retrier.call_with_retry(
            || {
                attempts += 1;
                Err(conflict())
            },
            is_failed_txn_retriable,
        );
        assert_eq!(attempts, 1);
    }
}
