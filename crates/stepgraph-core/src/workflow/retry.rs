//! Retry decisions for failed step runs.
//!
//! Stateless: all logic lives in associated functions that take the retry
//! configuration as a parameter. Only transient failures are retried, and
//! timeouts only when the engine treats them as transient.

use std::time::Duration;

use stepgraph_types::config::RetryConfig;

use super::body::StepError;

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failed one.
    ///
    /// `attempt` is 1-based (the first execution is attempt 1); `limit`
    /// counts retries, so at most `limit + 1` attempts run.
    pub fn should_retry(
        config: &RetryConfig,
        attempt: u32,
        error: &StepError,
        timeout_is_transient: bool,
    ) -> bool {
        if attempt > config.limit {
            return false;
        }
        match error {
            StepError::Transient(_) => true,
            StepError::Timeout(_) => timeout_is_transient,
            StepError::Fatal(_) | StepError::Cancelled | StepError::Graph(_) => false,
        }
    }

    /// Delay before the attempt following `attempt`: `backoff_ms` doubled
    /// per prior retry, capped at `max_backoff_ms`.
    pub fn delay(config: &RetryConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ms = config
            .backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(config.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_transient_within_limit() {
        let config = RetryConfig::limited(2);
        let err = StepError::transient("busy");
        assert!(RetryHandler::should_retry(&config, 1, &err, false));
        assert!(RetryHandler::should_retry(&config, 2, &err, false));
        assert!(!RetryHandler::should_retry(&config, 3, &err, false));
    }

    #[test]
    fn test_never_retries_fatal_or_cancelled() {
        let config = RetryConfig::limited(5);
        assert!(!RetryHandler::should_retry(&config, 1, &StepError::fatal("bad input"), true));
        assert!(!RetryHandler::should_retry(&config, 1, &StepError::Cancelled, true));
    }

    #[test]
    fn test_timeout_retry_follows_engine_setting() {
        let config = RetryConfig::limited(1);
        let err = StepError::Timeout(5);
        assert!(!RetryHandler::should_retry(&config, 1, &err, false));
        assert!(RetryHandler::should_retry(&config, 1, &err, true));
    }

    #[test]
    fn test_default_config_does_not_retry() {
        let config = RetryConfig::default();
        assert!(!RetryHandler::should_retry(&config, 1, &StepError::transient("x"), false));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            limit: 10,
            backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(RetryHandler::delay(&config, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay(&config, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay(&config, 3), Duration::from_millis(350));
        assert_eq!(RetryHandler::delay(&config, 40), Duration::from_millis(350));
    }
}
