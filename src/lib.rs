//! # callcache
//!
//! Cached, single-flight, policy-wrapped invocation of declared remote APIs.
//!
//! Methods of a remote API are declared once: which ones are cached, how
//! (`GetOrFetch` or stale-then-fresh `GetAndFetch`), for how long, which
//! parameter identifies the cached entry, and which resilience policies wrap
//! the remote call. [`ApiClient`] then serves calls from the cache, coalesces
//! concurrent identical fetches into one, and writes results back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use callcache::{ApiClient, Call, CacheConfig, RemoteError};
//! use callcache::client::Invoker;
//! use callcache::descriptor::{ApiDeclaration, MethodDeclaration, MethodDescriptor, ParamDeclaration};
//! use serde_json::{Value, json};
//!
//! struct Users;
//!
//! #[async_trait]
//! impl Invoker for Users {
//!     async fn invoke(&self, _method: &MethodDescriptor, args: &[Value]) -> Result<Value, RemoteError> {
//!         Ok(json!({ "id": args[0], "name": "ada" }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder(Users)
//!         .declare(
//!             ApiDeclaration::new("IUserApi").method(
//!                 MethodDeclaration::new("GetUser")
//!                     .cache(CacheConfig::get_or_fetch().with_ttl(Duration::from_secs(3600)))
//!                     .param(ParamDeclaration::value("id").cache_key()),
//!             ),
//!         )
//!         .build()?;
//!
//!     // First call reaches the remote, the second is served from the cache.
//!     let user: Value = client.execute(Call::new("IUserApi", "GetUser").arg(42)).await?;
//!     let again: Value = client.execute(Call::new("IUserApi", "GetUser").arg(42)).await?;
//!     assert_eq!(user, again);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod descriptor;
pub mod error;
pub mod flight;
pub mod key;
pub mod policy;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{ApiClient, ApiClientBuilder, Invoker};
pub use descriptor::{CacheConfig, CacheMode, MethodDescriptor};
pub use error::{ApiError, ConfigError, RemoteError, StoreError};
pub use key::{CacheKey, Call};
pub use store::{CacheStore, MemoryStore, StoreConfig};
