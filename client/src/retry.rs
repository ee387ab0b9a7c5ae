//! Retry logic for read-only node calls.
//!
//! Only idempotent requests go through [`RetryStrategy::retry`]. Transaction
//! submission is sent exactly once: a blind resend after an ambiguous failure
//! could apply a loan transition twice.

use crate::config::ClientConfig;
use crate::error::{Result, RetryContext, SahakariError};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryStrategy {
    /// Create a new retry strategy from client config
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier,
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Check if an error is transient
    pub fn is_retryable(error: &SahakariError) -> bool {
        match error {
            SahakariError::Network(_) => true,
            SahakariError::RateLimitExceeded(_) => true,
            SahakariError::Rpc(msg) => {
                msg.contains("HTTP 500")
                    || msg.contains("HTTP 502")
                    || msg.contains("HTTP 503")
                    || msg.contains("HTTP 504")
            }
            SahakariError::InvalidResponse(_) => true,
            _ => false,
        }
    }

    /// Execute a read with retry logic
    pub async fn retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_with_predicate(operation, Self::is_retryable)
            .await
    }

    /// Execute a read with retry logic and a custom retry predicate
    pub async fn retry_with_predicate<F, Fut, T, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&SahakariError) -> bool,
    {
        let mut backoff = self.create_backoff();
        let mut retry_ctx = RetryContext::new();

        loop {
            debug!(
                "Attempt {} of {}",
                retry_ctx.attempts + 1,
                self.max_retries + 1
            );

            match operation().await {
                Ok(result) => {
                    if retry_ctx.attempts > 0 {
                        debug!(
                            "Operation succeeded after {} retries ({} ms waiting)",
                            retry_ctx.attempts, retry_ctx.total_time_ms
                        );
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !should_retry(&error) {
                        debug!("Non-retryable error: {:?}", error);
                        return Err(error);
                    }

                    if retry_ctx.attempts >= self.max_retries {
                        warn!(
                            "Max retries ({}) exceeded. Last error: {:?}",
                            self.max_retries, error
                        );
                        return Err(SahakariError::MaxRetriesExceeded(self.max_retries));
                    }

                    let delay = match backoff.next_backoff() {
                        Some(d) => d,
                        None => {
                            warn!("Backoff exhausted");
                            return Err(SahakariError::MaxRetriesExceeded(self.max_retries));
                        }
                    };

                    retry_ctx.record_attempt(&error.to_string(), delay.as_millis() as u64);

                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        retry_ctx.attempts, error, delay
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_strategy(max_retries: usize) -> RetryStrategy {
        RetryStrategy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_strategy_from_config() {
        let config = test_config();
        let strategy = RetryStrategy::from_config(&config);
        assert_eq!(strategy.max_retries, config.max_retries);
        assert_eq!(
            strategy.initial_delay,
            Duration::from_millis(config.retry_initial_delay_ms)
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(RetryStrategy::is_retryable(
            &SahakariError::RateLimitExceeded(60)
        ));
        assert!(RetryStrategy::is_retryable(&SahakariError::Rpc(
            "HTTP 503 Service Unavailable: busy".to_string()
        )));
        assert!(!RetryStrategy::is_retryable(&SahakariError::Rpc(
            "execution reverted (code: 3)".to_string()
        )));
        assert!(!RetryStrategy::is_retryable(
            &SahakariError::SubmissionRejected("user denied".to_string())
        ));
        assert!(!RetryStrategy::is_retryable(&SahakariError::NotFound(
            "loan".to_string()
        )));
    }

    #[tokio::test]
    async fn test_retry_success_after_retries() {
        let strategy = fast_strategy(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = strategy
            .retry(|| async {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(SahakariError::InvalidResponse("truncated".to_string()))
                } else {
                    Ok::<i32, SahakariError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_max_retries_exceeded() {
        let strategy = fast_strategy(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = strategy
            .retry(|| async {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Err::<i32, SahakariError>(SahakariError::RateLimitExceeded(1))
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            SahakariError::MaxRetriesExceeded(2)
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let strategy = fast_strategy(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = strategy
            .retry(|| async {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Err::<i32, SahakariError>(SahakariError::Abi("bad word".to_string()))
            })
            .await;

        assert!(matches!(result.unwrap_err(), SahakariError::Abi(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
