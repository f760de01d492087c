//! Per-attempt time limit.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Operation, Policy};
use crate::error::RemoteError;

/// Fails an attempt with [`RemoteError::Timeout`] once `timeout` elapses.
///
/// Placed inside a [`RetryPolicy`](super::RetryPolicy) it bounds each attempt;
/// outside, it bounds the whole retry sequence.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    timeout: Duration,
}

impl TimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Policy for TimeoutPolicy {
    async fn execute(&self, operation: Operation) -> Result<Value, RemoteError> {
        match tokio::time::timeout(self.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.timeout)),
        }
    }
}
