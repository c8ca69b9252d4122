//! Deadlines for adapter and sink calls.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Operation '{operation}' timed out after {duration:?}")]
pub struct TimeoutError {
    pub duration: Duration,
    pub operation: String,
}

/// Either the deadline passed or the operation itself failed.
#[derive(Debug, Clone, Error)]
pub enum TimeoutOrError<E> {
    #[error(transparent)]
    Timeout(TimeoutError),

    #[error("{0}")]
    Error(E),
}

impl<E> TimeoutOrError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutOrError::Timeout(_))
    }
}

/// Run a fallible future with a deadline.
pub async fn timeout_result<Fut, T, E>(
    timeout: Duration,
    operation_name: &str,
    operation: Fut,
) -> Result<T, TimeoutOrError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TimeoutOrError::Error(e)),
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(TimeoutOrError::Timeout(TimeoutError {
                duration: timeout,
                operation: operation_name.to_string(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_result_success_and_error() {
        let ok: Result<i32, TimeoutOrError<&str>> =
            timeout_result(Duration::from_secs(1), "fast", async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        let err: Result<i32, TimeoutOrError<&str>> =
            timeout_result(Duration::from_secs(1), "failing", async { Err("boom") }).await;
        match err {
            Err(TimeoutOrError::Error(e)) => assert_eq!(e, "boom"),
            _ => panic!("expected operation error"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_result_deadline() {
        let result: Result<i32, TimeoutOrError<&str>> = timeout_result(Duration::from_millis(10), "slow_page", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .await;

        match result {
            Err(TimeoutOrError::Timeout(e)) => {
                assert_eq!(e.operation, "slow_page");
                assert_eq!(e.duration, Duration::from_millis(10));
            }
            _ => panic!("expected timeout"),
        }
    }
}
