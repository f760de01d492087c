//! Circuit breaker.
//!
//! ```text
//!   Closed ──(threshold consecutive failures)──▶ Open
//!     ▲                                            │
//!     │                               (recovery timeout elapses)
//!     │                                            ▼
//!     └────────────(trial succeeds)───────────  HalfOpen ──(trial fails)──▶ Open
//! ```

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{Operation, Policy};
use crate::error::RemoteError;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    // Start of the single trial call allowed while half-open.
    trial_started: Option<Instant>,
}

/// Rejects calls with [`RemoteError::CircuitOpen`] after too many consecutive
/// transient failures, then lets one trial call through once the recovery
/// timeout has passed.
///
/// Only transient failures count against the circuit; a `404` says nothing
/// about the remote's health.
pub struct CircuitBreakerPolicy {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    breaker: Mutex<Breaker>,
}

impl CircuitBreakerPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, breaker: &mut Breaker, to: CircuitState) {
        if breaker.state == to {
            return;
        }
        info!(circuit = %self.name, from = %breaker.state, to = %to, "circuit breaker state transition");
        breaker.state = to;
        match to {
            CircuitState::Open => {
                breaker.opened_at = Some(Instant::now());
                breaker.trial_started = None;
            }
            CircuitState::Closed => {
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
                breaker.trial_started = None;
            }
            CircuitState::HalfOpen => breaker.trial_started = None,
        }
    }

    fn permit(&self) -> bool {
        let mut breaker = self.lock();
        if breaker.state == CircuitState::Open {
            let recovered = breaker
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.recovery_timeout);
            if !recovered {
                return false;
            }
            self.transition(&mut breaker, CircuitState::HalfOpen);
        }

        let trial_started = breaker.trial_started;
        match breaker.state {
            CircuitState::Closed => true,
            // A trial abandoned mid-flight is given up on after one more timeout.
            CircuitState::HalfOpen => match trial_started {
                Some(started) if started.elapsed() < self.recovery_timeout => false,
                _ => {
                    breaker.trial_started = Some(Instant::now());
                    true
                }
            },
            CircuitState::Open => false,
        }
    }

    fn record_success(&self) {
        let mut breaker = self.lock();
        breaker.consecutive_failures = 0;
        self.transition(&mut breaker, CircuitState::Closed);
    }

    fn record_failure(&self) {
        let mut breaker = self.lock();
        breaker.consecutive_failures += 1;
        let trip = breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= self.failure_threshold;
        if trip {
            warn!(
                circuit = %self.name,
                failures = breaker.consecutive_failures,
                "circuit breaker tripped"
            );
            self.transition(&mut breaker, CircuitState::Open);
        }
    }
}

#[async_trait]
impl Policy for CircuitBreakerPolicy {
    async fn execute(&self, operation: Operation) -> Result<Value, RemoteError> {
        if !self.permit() {
            return Err(RemoteError::CircuitOpen(self.name.clone()));
        }

        let result = operation().await;
        match &result {
            Err(error) if error.is_transient() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::constant;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    fn failing() -> Operation {
        Arc::new(|| async { Err::<Value, _>(RemoteError::Transport("down".into())) }.boxed())
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let breaker = CircuitBreakerPolicy::new("users").with_failure_threshold(2);
        assert!(breaker.execute(failing()).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.execute(failing()).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.execute(constant(json!(1))).await.unwrap_err();
        assert!(matches!(err, RemoteError::CircuitOpen(name) if name == "users"));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreakerPolicy::new("users").with_failure_threshold(2);
        assert!(breaker.execute(failing()).await.is_err());
        assert!(breaker.execute(constant(json!(1))).await.is_ok());
        assert!(breaker.execute(failing()).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_closes_circuit() {
        let breaker = CircuitBreakerPolicy::new("users")
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(20));
        assert!(breaker.execute(failing()).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.execute(constant(json!(2))).await.unwrap(), json!(2));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreakerPolicy::new("users")
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_millis(20));
        for _ in 0..3 {
            let _ = breaker.execute(failing()).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            breaker.execute(failing()).await,
            Err(RemoteError::Transport(_))
        ));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_trip() {
        let breaker = CircuitBreakerPolicy::new("users").with_failure_threshold(1);
        let not_found: Operation = Arc::new(|| {
            async {
                Err::<Value, _>(RemoteError::Status {
                    status: 404,
                    message: "missing".into(),
                })
            }
            .boxed()
        });
        assert!(breaker.execute(not_found).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
