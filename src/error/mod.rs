//! Error taxonomy for the invocation layer.
//!
//! | Error | Meaning | Retried? |
//! |-------|---------|----------|
//! | [`ConfigError`] | a declaration is wrong (missing or ambiguous primary key, …) | never |
//! | [`ApiError::KeyDerivation`] | the primary-key value could not be read from the arguments | never |
//! | [`RemoteError`] | the remote invoker failed | by the composed policy |
//! | [`StoreError`] | the cache store failed | swallowed by the client |
//!
//! [`ApiError`] is what callers of [`ApiClient`](crate::client::ApiClient) see.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// A defect in the declared configuration of an API interface or method.
///
/// These indicate programmer error and are surfaced immediately.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{method} declares a cache but none of its parameters is marked as the cache key")]
    MissingPrimaryKey { method: String },

    #[error("{method} marks more than one parameter as the cache key: {params:?}")]
    AmbiguousPrimaryKey { method: String, params: Vec<String> },

    #[error("{method} marks context parameter `{param}` as the cache key")]
    ContextPrimaryKey { method: String, param: String },

    #[error("{method} is not declared on an interface that declares a cache")]
    UndeclaredMethod { method: String },

    #[error("interface `{interface}` is declared more than once")]
    DuplicateInterface { interface: String },

    #[error("{method} is declared more than once")]
    DuplicateMethod { method: String },

    #[error("invalid declaration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A failure reported by the remote invoker or by a resilience policy around it.
///
/// `Clone` because a single failure is broadcast to every caller that joined
/// the same coalesced fetch.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit `{0}` is open")]
    CircuitOpen(String),

    #[error("remote call aborted: {0}")]
    Aborted(String),
}

impl RemoteError {
    /// Returns `true` for failures worth retrying: transport errors, timeouts,
    /// `429 Too Many Requests` and any `5xx` status.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Transport(_) | RemoteError::Timeout(_) => true,
            RemoteError::CircuitOpen(_) | RemoteError::Aborted(_) => false,
        }
    }
}

/// A failure of the external cache store.
///
/// Never returned from [`ApiClient`](crate::client::ApiClient) calls: reads that
/// fail count as misses, failed writes and removals are logged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned to callers of the invocation layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("no usable cache key value found for {method}")]
    KeyDerivation { method: String },

    #[error("remote call failed: {source}")]
    Remote {
        #[source]
        source: RemoteError,
        /// Last value known to the cache for this call, if any.
        cached: Option<Value>,
    },

    #[error("response of {method} could not be decoded: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub(crate) fn remote(source: RemoteError, cached: Option<Value>) -> Self {
        ApiError::Remote { source, cached }
    }

    /// Decodes the cached fallback value carried by a [`ApiError::Remote`].
    ///
    /// Returns `None` for other variants, when no value was cached, or when the
    /// cached value does not deserialize into `T`.
    pub fn cached_as<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            ApiError::Remote {
                cached: Some(value),
                ..
            } => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    /// The underlying remote failure, if this error came from the invoker.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            ApiError::Remote { source, .. } => Some(source),
            _ => None,
        }
    }
}
