//! Call values and deterministic cache key derivation.
//!
//! A [`Call`] is the structured form of one API invocation: the method's
//! [`MethodDescriptor`] plus its value arguments in declaration order. A
//! [`CacheKey`] is derived from a call and its method's [`ResolvedMethodPolicy`]:
//!
//! | Call | Key |
//! |------|-----|
//! | `IUserApi.GetUser(42)` | `IUserApi.GetUser(id:42)` |
//! | `IUserApi.Search({"id": "ab", "page": 2})` | `IUserApi.Search(id:ab)` |
//! | `IUserApi.ListUsers()` | `IUserApi.ListUsers()` |

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::descriptor::{MethodDescriptor, ResolvedMethodPolicy};
use crate::error::ApiError;

/// One invocation of a declared API method.
///
/// Context parameters are not part of `args`; cancelling a call means dropping
/// its future.
///
/// # Examples
///
/// ```
/// use callcache::key::Call;
///
/// let call = Call::new("IUserApi", "GetUser").arg(42);
/// assert_eq!(call.method().to_string(), "IUserApi.GetUser");
/// assert_eq!(call.args().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    method: MethodDescriptor,
    args: Vec<Value>,
}

impl Call {
    pub fn new(interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self::for_method(MethodDescriptor::new(interface, method))
    }

    pub fn for_method(method: MethodDescriptor) -> Self {
        Self {
            method,
            args: Vec::new(),
        }
    }

    /// Appends a scalar or an already-built JSON argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends any serializable argument, typically a request record.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error if `value` cannot be represented as JSON.
    pub fn try_arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

/// A cache key: `Type.Method(name:value)` or `Type.Method()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for `args` under `policy`.
    ///
    /// Scalar primary-key arguments are used directly. For a composite
    /// argument, the primary key's member name is looked up on every argument
    /// in order and the first scalar match wins; failing that, the designated
    /// argument's field at the primary key's position is used.
    ///
    /// # Errors
    ///
    /// [`ApiError::KeyDerivation`] when neither strategy yields a scalar value.
    /// A key never omits the discriminator of a method that declares one.
    pub fn derive(policy: &ResolvedMethodPolicy, args: &[Value]) -> Result<Self, ApiError> {
        let prefix = policy.descriptor.to_string();
        let Some(spec) = &policy.primary_key else {
            return Ok(Self(format!("{prefix}()")));
        };

        let value = args
            .get(spec.parameter_order)
            .and_then(|designated| match designated {
                Value::Object(_) | Value::Array(_) => {
                    by_member(args, spec.member_name()).or_else(|| by_position(designated, spec.parameter_order))
                }
                scalar => scalar_text(scalar),
            })
            .ok_or_else(|| ApiError::KeyDerivation {
                method: prefix.clone(),
            })?;

        Ok(Self(format!("{prefix}({}:{value})", spec.parameter_name)))
    }

    /// Prefix shared by every key of `method`, used to enumerate its entries.
    pub fn method_prefix(method: &MethodDescriptor) -> String {
        format!("{method}(")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

// JSON number formatting is locale-independent, so keys are stable across hosts.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn by_member(args: &[Value], member: &str) -> Option<String> {
    args.iter()
        .filter_map(Value::as_object)
        .find_map(|fields| fields.get(member).and_then(scalar_text))
}

fn by_position(designated: &Value, position: usize) -> Option<String> {
    match designated {
        Value::Object(fields) => fields.values().nth(position).and_then(scalar_text),
        Value::Array(items) => items.get(position).and_then(scalar_text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CacheConfig, PrimaryKeySpec};
    use serde_json::json;

    fn policy(method: &str, key: Option<(&str, usize, Option<&str>)>) -> ResolvedMethodPolicy {
        ResolvedMethodPolicy {
            descriptor: MethodDescriptor::new("IUserApi", method),
            cache_config: CacheConfig::get_or_fetch(),
            primary_key: key.map(|(name, order, member)| PrimaryKeySpec {
                parameter_name: name.to_string(),
                parameter_order: order,
                member: member.map(str::to_string),
            }),
        }
    }

    fn derive(policy: &ResolvedMethodPolicy, args: &[Value]) -> String {
        CacheKey::derive(policy, args).unwrap().into()
    }

    // ── scalar keys ───────────────────────────────────────────────────────────

    #[test]
    fn no_args_key() {
        assert_eq!(derive(&policy("ListUsers", None), &[]), "IUserApi.ListUsers()");
    }

    #[test]
    fn declared_key_without_argument_fails() {
        let p = policy("GetUser", Some(("id", 0, None)));
        let err = CacheKey::derive(&p, &[]).unwrap_err();
        assert!(matches!(err, ApiError::KeyDerivation { method } if method == "IUserApi.GetUser"));
    }

    #[test]
    fn integer_key() {
        let p = policy("GetUser", Some(("id", 0, None)));
        assert_eq!(derive(&p, &[json!(42)]), "IUserApi.GetUser(id:42)");
    }

    #[test]
    fn string_and_bool_keys() {
        let p = policy("GetUser", Some(("id", 0, None)));
        assert_eq!(derive(&p, &[json!("abc")]), "IUserApi.GetUser(id:abc)");
        assert_eq!(derive(&p, &[json!(true)]), "IUserApi.GetUser(id:true)");
    }

    #[test]
    fn float_key_is_invariant() {
        let p = policy("GetUser", Some(("id", 0, None)));
        assert_eq!(derive(&p, &[json!(1.5)]), "IUserApi.GetUser(id:1.5)");
    }

    #[test]
    fn key_uses_designated_position() {
        let p = policy("GetUser", Some(("id", 1, None)));
        assert_eq!(
            derive(&p, &[json!("tenant-a"), json!(7)]),
            "IUserApi.GetUser(id:7)"
        );
    }

    #[test]
    fn equal_values_equal_keys_differing_values_differ() {
        let p = policy("GetUser", Some(("id", 0, None)));
        assert_eq!(derive(&p, &[json!(42)]), derive(&p, &[json!(42)]));
        assert_ne!(derive(&p, &[json!(42)]), derive(&p, &[json!(43)]));
    }

    // ── composite keys ────────────────────────────────────────────────────────

    #[test]
    fn composite_member_match() {
        let p = policy("Search", Some(("id", 0, None)));
        let args = [json!({ "page": 2, "id": "u-1" })];
        assert_eq!(derive(&p, &args), "IUserApi.Search(id:u-1)");
    }

    #[test]
    fn declared_member_name_is_used() {
        let p = policy("Search", Some(("request", 0, Some("user_id"))));
        let args = [json!({ "user_id": 9, "page": 1 })];
        assert_eq!(derive(&p, &args), "IUserApi.Search(request:9)");
    }

    #[test]
    fn member_found_on_another_argument() {
        let p = policy("Search", Some(("id", 0, None)));
        let args = [json!({ "page": 1 }), json!({ "id": 77 })];
        assert_eq!(derive(&p, &args), "IUserApi.Search(id:77)");
    }

    #[test]
    fn positional_fallback_on_object() {
        let p = policy("Search", Some(("id", 0, None)));
        let args = [json!({ "user": "first", "page": 3 })];
        assert_eq!(derive(&p, &args), "IUserApi.Search(id:first)");
    }

    #[test]
    fn positional_fallback_on_array() {
        let p = policy("Search", Some(("id", 1, None)));
        let args = [json!("x"), json!(["a", "b"])];
        assert_eq!(derive(&p, &args), "IUserApi.Search(id:b)");
    }

    // ── failures ──────────────────────────────────────────────────────────────

    #[test]
    fn null_value_fails() {
        let p = policy("GetUser", Some(("id", 0, None)));
        let err = CacheKey::derive(&p, &[Value::Null]).unwrap_err();
        assert!(matches!(err, ApiError::KeyDerivation { method } if method == "IUserApi.GetUser"));
    }

    #[test]
    fn missing_argument_fails() {
        let p = policy("GetUser", Some(("id", 2, None)));
        assert!(CacheKey::derive(&p, &[json!(1)]).is_err());
    }

    #[test]
    fn composite_without_usable_value_fails() {
        let p = policy("Search", Some(("id", 0, None)));
        let args = [json!({ "nested": { "id": 1 } })];
        assert!(matches!(
            CacheKey::derive(&p, &args),
            Err(ApiError::KeyDerivation { .. })
        ));
    }

    #[test]
    fn call_builder_collects_args() {
        #[derive(Serialize)]
        struct Query {
            id: u32,
        }
        let call = Call::new("IUserApi", "Search")
            .arg("tenant")
            .try_arg(&Query { id: 5 })
            .unwrap();
        assert_eq!(call.args(), &[json!("tenant"), json!({ "id": 5 })]);
        assert_eq!(
            CacheKey::method_prefix(call.method()),
            "IUserApi.Search("
        );
    }
}
