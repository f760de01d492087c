//! Invocation orchestrator — the cache/fetch/store sequence around remote calls.
//!
//! [`ApiClient`] ties the other components together. For every [`Call`] it:
//!
//! 1. resolves the method's declaration (memoized per method),
//! 2. derives the cache key when the method is cacheable,
//! 3. serves from the [`CacheStore`] or runs one coalesced fetch through the
//!    method's composed [`Policy`], writing the result back.
//!
//! | Mode | Cache hit | Cache miss |
//! |------|-----------|------------|
//! | not cached | — | remote call, no cache interaction |
//! | `GetOrFetch` | cached value, no remote call | coalesced fetch, stored with TTL |
//! | `GetAndFetch` | cached value, then fresh value | fresh value |
//!
//! Cache store failures never fail a call: failed reads count as misses and
//! failed writes or removals are logged.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::descriptor::{
    ApiDeclaration, CacheConfig, CacheMode, Catalog, MethodDescriptor, Resolution, Resolver,
};
use crate::error::{ApiError, ConfigError, RemoteError};
use crate::flight::{Coalescer, FlightResult};
use crate::key::{Call, CacheKey};
use crate::policy::{self, Operation, Policy, PolicyComposer, PolicyRegistry};
use crate::store::{CacheStore, MemoryStore};

/// Executes the actual remote call, typically a generated REST binding.
///
/// # Contract
///
/// - `args` are the call's value arguments in declaration order.
/// - The returned JSON is what gets cached and decoded for callers.
/// - Implementations may be slow or unreliable; that is what policies are for.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, method: &MethodDescriptor, args: &[Value]) -> Result<Value, RemoteError>;
}

// How a single call is served, decided before anything suspends.
enum Plan {
    PassThrough,
    Cached { key: CacheKey, config: CacheConfig },
}

struct Inner {
    invoker: Arc<dyn Invoker>,
    store: Arc<dyn CacheStore>,
    resolver: Resolver,
    composer: PolicyComposer,
    policies: DashMap<MethodDescriptor, Option<Arc<dyn Policy>>>,
    coalescer: Coalescer,
}

/// Cached, single-flight, policy-wrapped client for one declared API.
///
/// Cheap to clone; clones share the memo tables and the in-flight table.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use callcache::client::{ApiClient, Invoker};
/// use callcache::descriptor::{ApiDeclaration, CacheConfig, MethodDeclaration, ParamDeclaration};
/// use callcache::key::Call;
///
/// # async fn example(invoker: impl Invoker + 'static) -> Result<(), Box<dyn std::error::Error>> {
/// let client = ApiClient::builder(invoker)
///     .declare(
///         ApiDeclaration::new("IUserApi").method(
///             MethodDeclaration::new("GetUser")
///                 .cache(CacheConfig::get_or_fetch().with_ttl(Duration::from_secs(3600)))
///                 .param(ParamDeclaration::value("id").cache_key()),
///         ),
///     )
///     .build()?;
///
/// let user: serde_json::Value = client.execute(Call::new("IUserApi", "GetUser").arg(42)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn builder(invoker: impl Invoker + 'static) -> ApiClientBuilder {
        ApiClientBuilder::new(Arc::new(invoker))
    }

    /// Performs `call` and returns a single value.
    ///
    /// In `GetAndFetch` mode the fresh value is returned; if the fetch fails,
    /// the stale cached value (if any) travels in [`ApiError::Remote`].
    ///
    /// # Errors
    ///
    /// - [`ApiError::Configuration`] — the method's declaration is invalid.
    /// - [`ApiError::KeyDerivation`] — the primary-key argument has no usable value.
    /// - [`ApiError::Remote`] — the remote call failed after its policies ran.
    /// - [`ApiError::Decode`] — the remote result does not deserialize into `T`.
    pub async fn execute<T: DeserializeOwned>(&self, call: Call) -> Result<T, ApiError> {
        let (plan, policy) = self.plan(&call)?;
        let call = Arc::new(call);

        match plan {
            Plan::PassThrough => {
                let value = policy::execute(policy.as_ref(), self.operation(&call))
                    .await
                    .map_err(|e| ApiError::remote(e, None))?;
                decode(call.method(), value)
            }
            Plan::Cached { key, config } if config.mode == CacheMode::GetOrFetch => {
                if let Some(value) = self.read::<T>(&key).await {
                    debug!(key = %key, "cache hit");
                    return Ok(value);
                }
                debug!(key = %key, "cache miss");
                let value = self
                    .fetch(&call, &key, &config, policy)
                    .await
                    .map_err(|e| ApiError::remote(e, None))?;
                decode(call.method(), value)
            }
            Plan::Cached { key, config } => {
                let stale = read_raw(self.inner.store.as_ref(), key.as_str()).await;
                let value = self
                    .fetch(&call, &key, &config, policy)
                    .await
                    .map_err(|e| ApiError::remote(e, stale))?;
                decode(call.method(), value)
            }
        }
    }

    /// Performs `call` and emits its values as a stream.
    ///
    /// In `GetAndFetch` mode the stream yields the cached value (when there is
    /// one) and then the freshly fetched value, in that order. Every other
    /// mode yields exactly one item, the same one [`ApiClient::execute`]
    /// would return.
    pub fn stream<T>(&self, call: Call) -> BoxStream<'static, Result<T, ApiError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        async_stream::stream! {
            match client.plan(&call) {
                Ok((Plan::Cached { key, config }, policy)) if config.mode == CacheMode::GetAndFetch => {
                    let stale = read_raw(client.inner.store.as_ref(), key.as_str()).await;

                    // The refresh runs even if the consumer stops after the cached value.
                    let refresh = {
                        let client = client.clone();
                        let call = Arc::new(call);
                        let key = key.clone();
                        tokio::spawn(async move {
                            let result = client.fetch(&call, &key, &config, policy).await;
                            (call, result)
                        })
                    };

                    if let Some(value) = &stale {
                        match serde_json::from_value::<T>(value.clone()) {
                            Ok(value) => {
                                debug!(key = %key, "emitting cached value before refresh");
                                yield Ok(value);
                            }
                            Err(error) => warn!(key = %key, error = %error, "cached value does not decode, skipping"),
                        }
                    }

                    match refresh.await {
                        Ok((call, Ok(value))) => yield decode(call.method(), value),
                        Ok((_, Err(error))) => yield Err(ApiError::remote(error, stale)),
                        Err(error) => yield Err(ApiError::remote(RemoteError::Aborted(error.to_string()), stale)),
                    }
                }
                Ok(_) => yield client.execute::<T>(call).await,
                Err(error) => yield Err(error),
            }
        }
        .boxed()
    }

    /// Removes the cached entry for `call`.
    ///
    /// Returns `false` when the method is not cacheable or nothing was cached.
    ///
    /// # Errors
    ///
    /// Configuration and key derivation errors, as for [`ApiClient::execute`].
    pub async fn invalidate(&self, call: &Call) -> Result<bool, ApiError> {
        let (plan, _) = self.plan(call)?;
        match plan {
            Plan::PassThrough => Ok(false),
            Plan::Cached { key, .. } => Ok(remove_quietly(self.inner.store.as_ref(), key.as_str()).await),
        }
    }

    /// Removes every cached entry of `method` and returns how many were removed.
    pub async fn invalidate_method(&self, method: &MethodDescriptor) -> usize {
        let prefix = CacheKey::method_prefix(method);
        let entries = match self.inner.store.entries().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(method = %method, error = %error, "cache enumeration failed");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.iter().filter(|entry| entry.key.starts_with(&prefix)) {
            if remove_quietly(self.inner.store.as_ref(), &entry.key).await {
                removed += 1;
            }
        }
        debug!(method = %method, removed, "invalidated method entries");
        removed
    }

    /// Resolution of `method`, as used for calls.
    ///
    /// # Errors
    ///
    /// A [`ConfigError`] when the method's declaration is invalid.
    pub fn resolve(&self, method: &MethodDescriptor) -> Result<Arc<Resolution>, ConfigError> {
        self.inner.resolver.resolve(method)
    }

    /// Number of coalesced fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }

    fn plan(&self, call: &Call) -> Result<(Plan, Option<Arc<dyn Policy>>), ApiError> {
        let resolution = self.inner.resolver.resolve(call.method())?;
        let policy = self.policy_for(call.method(), &resolution.policy_keys);

        let plan = match &resolution.cache {
            None => Plan::PassThrough,
            Some(cached) => Plan::Cached {
                key: CacheKey::derive(cached, call.args())?,
                config: cached.cache_config.clone(),
            },
        };
        Ok((plan, policy))
    }

    // Composed once per method so unknown registry keys are reported once.
    fn policy_for(&self, method: &MethodDescriptor, keys: &[String]) -> Option<Arc<dyn Policy>> {
        self.inner
            .policies
            .entry(method.clone())
            .or_insert_with(|| self.inner.composer.compose(keys))
            .clone()
    }

    fn operation(&self, call: &Arc<Call>) -> Operation {
        let invoker = Arc::clone(&self.inner.invoker);
        let call = Arc::clone(call);
        Arc::new(move || {
            let invoker = Arc::clone(&invoker);
            let call = Arc::clone(&call);
            async move { invoker.invoke(call.method(), call.args()).await }.boxed()
        })
    }

    // One coalesced, policy-wrapped remote call that also updates the cache.
    async fn fetch(
        &self,
        call: &Arc<Call>,
        key: &CacheKey,
        config: &CacheConfig,
        policy: Option<Arc<dyn Policy>>,
    ) -> FlightResult {
        let store = Arc::clone(&self.inner.store);
        let operation = self.operation(call);
        let owned_key = key.to_string();
        let config = config.clone();

        self.inner
            .coalescer
            .run(key.as_str(), move || async move {
                match policy::execute(policy.as_ref(), operation).await {
                    Ok(value) => {
                        // Overwrite in place so concurrent readers see either value, never a gap.
                        write_quietly(store.as_ref(), &owned_key, value.clone(), &config).await;
                        Ok(value)
                    }
                    Err(error) => {
                        if config.invalidate_on_error && remove_quietly(store.as_ref(), &owned_key).await {
                            debug!(key = %owned_key, "invalidated cached entry after failed fetch");
                        }
                        Err(error)
                    }
                }
            })
            .await
    }

    async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = read_raw(self.inner.store.as_ref(), key.as_str()).await?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key = %key, error = %error, "cached value does not decode, treating as miss");
                None
            }
        }
    }
}

fn decode<T: DeserializeOwned>(method: &MethodDescriptor, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|source| ApiError::Decode {
        method: method.to_string(),
        source,
    })
}

async fn read_raw(store: &dyn CacheStore, key: &str) -> Option<Value> {
    match store.get(key).await {
        Ok(value) => value,
        Err(error) => {
            warn!(key, error = %error, "cache read failed, treating as miss");
            None
        }
    }
}

async fn write_quietly(store: &dyn CacheStore, key: &str, value: Value, config: &CacheConfig) {
    if let Err(error) = store.set(key, value, config.ttl).await {
        warn!(key, error = %error, "cache write failed");
    }
}

async fn remove_quietly(store: &dyn CacheStore, key: &str) -> bool {
    match store.remove(key).await {
        Ok(removed) => removed,
        Err(error) => {
            warn!(key, error = %error, "cache removal failed");
            false
        }
    }
}

/// Assembles an [`ApiClient`] and validates its declarations.
pub struct ApiClientBuilder {
    invoker: Arc<dyn Invoker>,
    store: Option<Arc<dyn CacheStore>>,
    registry: Option<Arc<dyn PolicyRegistry>>,
    catalog: Catalog,
    error: Option<ConfigError>,
}

impl ApiClientBuilder {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            invoker,
            store: None,
            registry: None,
            catalog: Catalog::new(),
            error: None,
        }
    }

    /// Uses `store` instead of a default [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policies(mut self, registry: Arc<dyn PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Adds the declarations of one interface.
    pub fn declare(mut self, api: ApiDeclaration) -> Self {
        if let Err(error) = self.catalog.declare(api) {
            self.error.get_or_insert(error);
        }
        self
    }

    /// Replaces all declarations with `catalog`.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// # Errors
    ///
    /// The first [`ConfigError`] found while declaring or validating.
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.catalog.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::default()));

        Ok(ApiClient {
            inner: Arc::new(Inner {
                invoker: self.invoker,
                store,
                resolver: Resolver::new(Arc::new(self.catalog)),
                composer: PolicyComposer::new(self.registry),
                policies: DashMap::new(),
                coalescer: Coalescer::new(),
            }),
        })
    }
}
