use crate::config::RetryStrategyConfig;
use crate::error::{FloodControlError, Result};
use crate::retry_strategy::{self, ExponentialBackoffStrategy, RetryStrategy};
use log::warn;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;

/// How many times a call is attempted and how long to wait in between.
#[derive(Clone)]
pub struct RetryPolicy {
    strategy: Arc<dyn RetryStrategy>,
    max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(strategy: Arc<dyn RetryStrategy>, max_attempts: usize) -> Self {
        RetryPolicy {
            strategy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryStrategyConfig) -> Self {
        Self::new(
            Arc::from(retry_strategy::from_config(config)),
            config.max_attempts,
        )
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(Arc::new(ExponentialBackoffStrategy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }), 1)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delays between consecutive attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let strategy = Arc::clone(&self.strategy);
        (0..self.max_attempts - 1).map(move |attempt| strategy.delay(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryStrategyConfig::default())
    }
}

/// Runs `action` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry_store_call<T, A, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    action: A,
) -> Result<T>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryIf::spawn(policy.delays(), action, |err: &FloodControlError| {
        let retry = err.is_retryable();
        if retry {
            warn!("Retrying store call {} after error: {}", operation, err);
        }
        retry
    })
    .await
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped()
}

/// Opens a multiplexed connection, retrying transient transport failures.
pub async fn connect_with_retry(
    client: &Client,
    policy: &RetryPolicy,
) -> RedisResult<MultiplexedConnection> {
    RetryIf::spawn(
        policy.delays(),
        || client.get_multiplexed_tokio_connection(),
        |err: &RedisError| {
            let retry = is_transient(err);
            if retry {
                warn!("Failed to connect to Redis, retrying: {}", err);
            }
            retry
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(
            Arc::new(ExponentialBackoffStrategy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            }),
            max_attempts,
        )
    }

    #[test]
    fn test_delays_are_one_fewer_than_attempts() {
        assert_eq!(fast_policy(4).delays().count(), 3);
        assert_eq!(RetryPolicy::no_retry().delays().count(), 0);
        assert_eq!(fast_policy(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_store_call(&fast_policy(3), "counter_get", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(FloodControlError::StoreUnavailable("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_store_call(&fast_policy(2), "counter_get", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FloodControlError::StoreUnavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(FloodControlError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_corrupt_entries() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_store_call(&fast_policy(5), "queue_peek_head", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FloodControlError::CorruptEntry {
                    token: "x".into(),
                    reason: "bad".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(FloodControlError::CorruptEntry { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
