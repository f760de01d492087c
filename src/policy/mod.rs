//! Resilience policies and their composition.
//!
//! A [`Policy`] wraps an [`Operation`] (a re-invocable remote call) and decides
//! how failures are handled: retried, cut short, or rejected outright. Methods
//! name the policies they want by registry key; the [`PolicyComposer`] looks
//! those keys up in a [`PolicyRegistry`] and chains the hits into one
//! [`ComposedPolicy`], first key outermost.
//!
//! ## Built-in policies
//!
//! - [`RetryPolicy`] — exponential backoff on transient failures.
//! - [`TimeoutPolicy`] — bounds each attempt.
//! - [`CircuitBreakerPolicy`] — stops calling a failing remote for a while.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::error::RemoteError;

pub mod breaker;
pub mod retry;
pub mod timeout;

pub use breaker::{CircuitBreakerPolicy, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

/// A remote call that a policy may start any number of times.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

/// A resilience behavior applied around an [`Operation`].
///
/// # Contract
///
/// - Implementations are shared across tasks and must be `Send + Sync`.
/// - A policy may invoke `operation` zero times (rejecting the call), once, or
///   repeatedly; it returns the result it settles on.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn execute(&self, operation: Operation) -> Result<Value, RemoteError>;
}

/// Named policies available to methods.
pub trait PolicyRegistry: Send + Sync {
    fn lookup(&self, key: &str) -> Option<Arc<dyn Policy>>;
}

/// A [`PolicyRegistry`] backed by a map.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use callcache::policy::{PolicyMap, PolicyRegistry, RetryPolicy, TimeoutPolicy};
///
/// let registry = PolicyMap::new()
///     .with("retry", RetryPolicy::new(3))
///     .with("timeout", TimeoutPolicy::new(Duration::from_secs(5)));
///
/// assert!(registry.lookup("retry").is_some());
/// assert!(registry.lookup("circuit").is_none());
/// ```
#[derive(Clone, Default)]
pub struct PolicyMap {
    policies: HashMap<String, Arc<dyn Policy>>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, policy: impl Policy + 'static) -> Self {
        self.insert(key, Arc::new(policy));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, policy: Arc<dyn Policy>) {
        self.policies.insert(key.into(), policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl PolicyRegistry for PolicyMap {
    fn lookup(&self, key: &str) -> Option<Arc<dyn Policy>> {
        self.policies.get(key).cloned()
    }
}

/// Policies chained outer-to-inner.
pub struct ComposedPolicy {
    chain: Vec<Arc<dyn Policy>>,
}

impl ComposedPolicy {
    pub fn new(chain: Vec<Arc<dyn Policy>>) -> Self {
        Self { chain }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[async_trait]
impl Policy for ComposedPolicy {
    async fn execute(&self, operation: Operation) -> Result<Value, RemoteError> {
        let outermost = self
            .chain
            .iter()
            .rev()
            .fold(operation, |inner, policy| -> Operation {
                let policy = Arc::clone(policy);
                Arc::new(move || {
                    let policy = Arc::clone(&policy);
                    let inner = Arc::clone(&inner);
                    async move { policy.execute(inner).await }.boxed()
                })
            });
        outermost().await
    }
}

/// Builds the policy for a method from its declared registry keys.
#[derive(Clone, Default)]
pub struct PolicyComposer {
    registry: Option<Arc<dyn PolicyRegistry>>,
}

impl PolicyComposer {
    pub fn new(registry: Option<Arc<dyn PolicyRegistry>>) -> Self {
        Self { registry }
    }

    /// Returns `None` when there is no registry or none of `keys` is
    /// registered. Unknown keys are skipped with a warning.
    pub fn compose(&self, keys: &[String]) -> Option<Arc<dyn Policy>> {
        let registry = self.registry.as_ref()?;

        let mut chain: Vec<Arc<dyn Policy>> = keys
            .iter()
            .filter_map(|key| {
                let policy = registry.lookup(key);
                if policy.is_none() {
                    warn!(policy = %key, "policy key not found in registry, skipping");
                }
                policy
            })
            .collect();

        match chain.len() {
            0 => None,
            1 => chain.pop(),
            _ => Some(Arc::new(ComposedPolicy::new(chain))),
        }
    }
}

/// Runs `operation` through `policy`, or directly when there is none.
pub async fn execute(policy: Option<&Arc<dyn Policy>>, operation: Operation) -> Result<Value, RemoteError> {
    match policy {
        Some(policy) => policy.execute(operation).await,
        None => operation().await,
    }
}
