//! Retry with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Operation, Policy};
use crate::error::RemoteError;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Retries transient failures (see [`RemoteError::is_transient`]) up to
/// `max_retries` times, doubling the delay after every attempt.
///
/// Permanent failures such as `404` are returned on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Sets the first delay and the cap the doubling never exceeds.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay)
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn execute(&self, operation: Operation) -> Result<Value, RemoteError> {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    warn!(attempt, delay = ?delay, error = %error, "retrying remote call");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Fails with `error` for the first `failures` attempts, then succeeds.
    fn flaky(failures: u32, error: RemoteError, attempts: Arc<AtomicU32>) -> Operation {
        Arc::new(move || {
            let error = error.clone();
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < failures {
                    Err(error)
                } else {
                    Ok(json!("ok"))
                }
            }
            .boxed()
        })
    }

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::new(5).with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn recovers_from_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let op = flaky(2, RemoteError::Transport("reset".into()), Arc::clone(&attempts));
        let value = fast(3).execute(op).await.unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let op = flaky(10, RemoteError::Transport("reset".into()), Arc::clone(&attempts));
        let err = fast(2).execute(op).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let error = RemoteError::Status {
            status: 404,
            message: "not found".into(),
        };
        let op = flaky(10, error, Arc::clone(&attempts));
        assert!(fast(5).execute(op).await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
