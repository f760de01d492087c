//! Method descriptors, cache configuration, and the memoizing resolver.
//!
//! A [`MethodDescriptor`] names one method of a declared remote-API interface.
//! The [`Resolver`] turns a descriptor into a [`Resolution`]: whether calls to
//! that method are cached, how, and which resilience policies wrap them. Each
//! descriptor is resolved once per resolver; later calls read the memo table.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub mod declaration;

pub use declaration::{
    ApiDeclaration, CacheKeyDeclaration, Catalog, MethodDeclaration, ParamDeclaration, ParamKind,
};

/// Stable identity of a method on a declared remote-API interface.
///
/// # Examples
///
/// ```
/// use callcache::descriptor::MethodDescriptor;
///
/// let descriptor = MethodDescriptor::new("IUserApi", "GetUser");
/// assert_eq!(descriptor.to_string(), "IUserApi.GetUser");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDescriptor {
    interface: String,
    method: String,
}

impl MethodDescriptor {
    pub fn new(interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            method: method.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.method)
    }
}

/// Consistency behavior of a cached method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Serve from cache; fetch (coalesced) only on a miss.
    #[default]
    GetOrFetch,
    /// Serve the cached value immediately, then always fetch a fresh one.
    GetAndFetch,
}

/// Cache declaration carried by an interface or a method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub mode: CacheMode,
    /// `None` keeps entries until they are removed.
    #[serde(default, rename = "ttl_seconds", with = "ttl_seconds")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub invalidate_on_error: bool,
}

impl CacheConfig {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            ttl: None,
            invalidate_on_error: false,
        }
    }

    pub fn get_or_fetch() -> Self {
        Self::new(CacheMode::GetOrFetch)
    }

    pub fn get_and_fetch() -> Self {
        Self::new(CacheMode::GetAndFetch)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }
}

mod ttl_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_some(&ttl.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Which argument supplies the variable part of a method's cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeySpec {
    pub parameter_name: String,
    /// Position among the method's value parameters (context parameters excluded).
    pub parameter_order: usize,
    /// Field read from composite arguments; see [`PrimaryKeySpec::member_name`].
    pub member: Option<String>,
}

impl PrimaryKeySpec {
    /// The field name looked up on composite arguments: the declared member,
    /// or the parameter name when none was declared.
    pub fn member_name(&self) -> &str {
        self.member.as_deref().unwrap_or(&self.parameter_name)
    }
}

/// Cache configuration of a cacheable method, fixed after first resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethodPolicy {
    pub descriptor: MethodDescriptor,
    pub cache_config: CacheConfig,
    pub primary_key: Option<PrimaryKeySpec>,
}

/// Memoized outcome of resolving a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the method is not cacheable.
    pub cache: Option<ResolvedMethodPolicy>,
    /// Policy registry keys, outermost first.
    pub policy_keys: Vec<String>,
}

impl Resolution {
    pub(crate) fn pass_through(descriptor: MethodDescriptor, policy_keys: Vec<String>) -> Self {
        debug!(method = %descriptor, "method is not cacheable");
        Self {
            cache: None,
            policy_keys,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache.is_some()
    }
}

/// Resolves descriptors against a [`Catalog`], at most once per descriptor.
///
/// The memo table sits behind a mutex held only for the in-memory lookup and
/// population, so concurrent first calls for the same descriptor resolve it
/// once and the others read the stored outcome.
pub struct Resolver {
    catalog: Arc<Catalog>,
    memo: Mutex<HashMap<MethodDescriptor, Arc<Resolution>>>,
    lookups: AtomicUsize,
}

impl Resolver {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            memo: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Returns the resolution for `descriptor`, computing it on first use.
    ///
    /// Non-cacheable outcomes are memoized too. Failures are not: they are
    /// configuration defects and every call reports them.
    ///
    /// # Errors
    ///
    /// A [`ConfigError`] when the method declares a cache but its primary key
    /// is missing or ambiguous, or the method is undeclared on an interface
    /// that declares a cache.
    pub fn resolve(&self, descriptor: &MethodDescriptor) -> Result<Arc<Resolution>, ConfigError> {
        let mut memo = self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(resolution) = memo.get(descriptor) {
            return Ok(Arc::clone(resolution));
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        let resolution = Arc::new(self.catalog.resolve(descriptor)?);
        debug!(
            method = %descriptor,
            cacheable = resolution.is_cacheable(),
            policies = resolution.policy_keys.len(),
            "resolved method"
        );
        memo.insert(descriptor.clone(), Arc::clone(&resolution));
        Ok(resolution)
    }

    /// Number of times the catalog was consulted.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}
