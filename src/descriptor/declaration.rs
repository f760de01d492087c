//! Declarative configuration attached to API interfaces and their methods.
//!
//! Declarations are plain data: they can be built in code with the builder
//! methods below or loaded from a JSON document with [`Catalog::from_json`].
//!
//! ```
//! use callcache::descriptor::Catalog;
//!
//! let catalog = Catalog::from_json(r#"{
//!     "apis": [{
//!         "interface": "IUserApi",
//!         "cache": { "mode": "get_or_fetch", "ttl_seconds": 3600 },
//!         "methods": [{
//!             "name": "GetUser",
//!             "params": [{ "name": "id", "cache_key": {} }]
//!         }]
//!     }]
//! }"#).unwrap();
//!
//! assert!(catalog.validate().is_ok());
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{CacheConfig, MethodDescriptor, PrimaryKeySpec, ResolvedMethodPolicy, Resolution};
use crate::error::ConfigError;

/// Whether a parameter carries a value or only call context.
///
/// Context parameters (cancellation tokens, request contexts) never take part
/// in cache key derivation and are not counted in parameter positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Value,
    Context,
}

/// Marks a parameter as the one that discriminates cache entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyDeclaration {
    /// Field to read when the argument is a composite value.
    /// Defaults to the parameter name.
    #[serde(default)]
    pub member: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDeclaration {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub cache_key: Option<CacheKeyDeclaration>,
}

impl ParamDeclaration {
    /// A value parameter.
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Value,
            cache_key: None,
        }
    }

    /// A context parameter, invisible to key derivation.
    pub fn context(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Context,
            cache_key: None,
        }
    }

    /// Marks this parameter as the cache key.
    pub fn cache_key(mut self) -> Self {
        self.cache_key = Some(CacheKeyDeclaration::default());
        self
    }

    /// Marks this parameter as the cache key, reading `member` from composite values.
    pub fn cache_key_member(mut self, member: impl Into<String>) -> Self {
        self.cache_key = Some(CacheKeyDeclaration {
            member: Some(member.into()),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDeclaration {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDeclaration>,
    /// Overrides the interface-level cache declaration.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    /// Policy registry keys, applied after the interface-level ones.
    #[serde(default)]
    pub policies: Vec<String>,
}

impl MethodDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            cache: None,
            policies: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamDeclaration) -> Self {
        self.params.push(param);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn policy(mut self, key: impl Into<String>) -> Self {
        self.policies.push(key.into());
        self
    }

    // Finds the single parameter flagged as cache key. Positions count value
    // parameters only.
    fn primary_key(
        &self,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<PrimaryKeySpec>, ConfigError> {
        let mut flagged = Vec::new();
        let mut order = 0;

        for param in &self.params {
            match (param.kind, &param.cache_key) {
                (ParamKind::Context, Some(_)) => {
                    return Err(ConfigError::ContextPrimaryKey {
                        method: descriptor.to_string(),
                        param: param.name.clone(),
                    });
                }
                (ParamKind::Context, None) => continue,
                (ParamKind::Value, Some(key)) => flagged.push(PrimaryKeySpec {
                    parameter_name: param.name.clone(),
                    parameter_order: order,
                    member: key.member.clone(),
                }),
                (ParamKind::Value, None) => {}
            }
            order += 1;
        }

        match flagged.len() {
            0 if order > 0 => Err(ConfigError::MissingPrimaryKey {
                method: descriptor.to_string(),
            }),
            0 => Ok(None),
            1 => Ok(flagged.pop()),
            _ => Err(ConfigError::AmbiguousPrimaryKey {
                method: descriptor.to_string(),
                params: flagged.into_iter().map(|spec| spec.parameter_name).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDeclaration {
    pub interface: String,
    /// Applies to every method that does not declare its own.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodDeclaration>,
}

impl ApiDeclaration {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            cache: None,
            policies: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn policy(mut self, key: impl Into<String>) -> Self {
        self.policies.push(key.into());
        self
    }

    pub fn method(mut self, method: MethodDeclaration) -> Self {
        self.methods.push(method);
        self
    }

    fn find(&self, method: &str) -> Option<&MethodDeclaration> {
        self.methods.iter().find(|m| m.name == method)
    }

    // Interface keys first, then method keys; first occurrence wins.
    fn policy_keys(&self, method: Option<&MethodDeclaration>) -> Vec<String> {
        let method_keys = method.map(|m| m.policies.as_slice()).unwrap_or_default();
        let mut keys: Vec<String> = Vec::with_capacity(self.policies.len() + method_keys.len());
        for key in self.policies.iter().chain(method_keys) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

#[derive(Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    apis: Vec<ApiDeclaration>,
}

/// All declarations known to one client, keyed by interface name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    apis: HashMap<String, ApiDeclaration>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `{ "apis": [ … ] }` document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::DuplicateInterface`] when an interface appears twice.
    /// Per-method problems are reported by [`Catalog::validate`].
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let document: CatalogDocument = serde_json::from_str(document)?;
        let mut catalog = Self::new();
        for api in document.apis {
            catalog.declare(api)?;
        }
        Ok(catalog)
    }

    /// Adds an interface declaration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateInterface`] if the interface is already declared.
    pub fn declare(&mut self, api: ApiDeclaration) -> Result<(), ConfigError> {
        if self.apis.contains_key(&api.interface) {
            return Err(ConfigError::DuplicateInterface {
                interface: api.interface,
            });
        }
        self.apis.insert(api.interface.clone(), api);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    /// Checks every declared method eagerly.
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] found, in interface-name order so the report
    /// is stable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut interfaces: Vec<&String> = self.apis.keys().collect();
        interfaces.sort();

        for interface in interfaces {
            let api = &self.apis[interface];
            let mut seen: Vec<&str> = Vec::with_capacity(api.methods.len());
            for method in &api.methods {
                let descriptor = MethodDescriptor::new(interface.as_str(), method.name.as_str());
                if seen.contains(&method.name.as_str()) {
                    return Err(ConfigError::DuplicateMethod {
                        method: descriptor.to_string(),
                    });
                }
                seen.push(&method.name);
                if method.cache.is_some() || api.cache.is_some() {
                    method.primary_key(&descriptor)?;
                }
            }
        }
        Ok(())
    }

    /// Reads the cache and policy configuration that applies to `descriptor`.
    pub(crate) fn resolve(&self, descriptor: &MethodDescriptor) -> Result<Resolution, ConfigError> {
        let Some(api) = self.apis.get(descriptor.interface()) else {
            return Ok(Resolution::pass_through(descriptor.clone(), Vec::new()));
        };

        let method = api.find(descriptor.method());
        let policy_keys = api.policy_keys(method);

        let Some(method) = method else {
            if api.cache.is_some() {
                return Err(ConfigError::UndeclaredMethod {
                    method: descriptor.to_string(),
                });
            }
            return Ok(Resolution::pass_through(descriptor.clone(), policy_keys));
        };

        let Some(cache_config) = method.cache.clone().or_else(|| api.cache.clone()) else {
            return Ok(Resolution::pass_through(descriptor.clone(), policy_keys));
        };

        let primary_key = method.primary_key(descriptor)?;
        Ok(Resolution {
            cache: Some(ResolvedMethodPolicy {
                descriptor: descriptor.clone(),
                cache_config,
                primary_key,
            }),
            policy_keys,
        })
    }
}
