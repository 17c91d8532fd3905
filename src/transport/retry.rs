//! Retry policy collaborator
//!
//! Consulted by a partition fetcher after every failed request. Split errors
//! never reach the policy; they are handled by the cursor tree.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

use super::errors::BackendError;

/// What to do after a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given interval, then re-issue the same request
    Retry(Duration),
    /// Surface the error
    Stop,
}

pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts retries already made for this request, starting at 0.
    fn should_retry(&self, error: &BackendError, attempt: u32) -> RetryDecision;
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &BackendError, _attempt: u32) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Jittered exponential backoff for transient errors.
///
/// A backend-supplied `retry_after` takes precedence over the computed
/// interval. Intervals never exceed `max_backoff`.
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl ExponentialRetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter_ms = (self.base_backoff.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        exp.saturating_add(jitter).min(self.max_backoff)
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn should_retry(&self, error: &BackendError, attempt: u32) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::Stop;
        }

        let interval = match error.retry_after {
            Some(after) => after.min(self.max_backoff),
            None => self.backoff(attempt),
        };
        RetryDecision::Retry(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExponentialRetryPolicy {
        ExponentialRetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100))
    }

    #[test]
    fn test_non_transient_stops() {
        let decision = policy().should_retry(&BackendError::bad_request("bad"), 0);
        assert_eq!(decision, RetryDecision::Stop);
    }

    #[test]
    fn test_attempts_exhausted() {
        let err = BackendError::service_unavailable("busy");
        assert!(matches!(policy().should_retry(&err, 2), RetryDecision::Retry(_)));
        assert_eq!(policy().should_retry(&err, 3), RetryDecision::Stop);
    }

    #[test]
    fn test_retry_after_honoured() {
        let err = BackendError::throttled(Some(Duration::from_millis(42)));
        assert_eq!(
            policy().should_retry(&err, 0),
            RetryDecision::Retry(Duration::from_millis(42))
        );
    }

    #[test]
    fn test_backoff_capped() {
        let err = BackendError::service_unavailable("busy");
        let policy = ExponentialRetryPolicy::new(
            100,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        match policy.should_retry(&err, 20) {
            RetryDecision::Retry(interval) => assert!(interval <= Duration::from_millis(100)),
            RetryDecision::Stop => panic!("expected retry"),
        }
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(
            NoRetry.should_retry(&BackendError::throttled(None), 0),
            RetryDecision::Stop
        );
    }
}
