//! Operation options
//!
//! Options travel as a name → JSON value map on the wire. [`OperationOptions`]
//! gives typed access to the names the connector understands and keeps the
//! rest for connector-specific lookups.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ConnectorError, ConnectorResult};

pub const OP_ATTRIBUTES_TO_GET: &str = "attributesToGet";
pub const OP_SCOPE: &str = "scope";
pub const OP_CONTAINER: &str = "container";
pub const OP_SORT_KEYS: &str = "sortKeys";
pub const OP_PAGE_SIZE: &str = "pageSize";
pub const OP_PAGED_RESULTS_OFFSET: &str = "pagedResultsOffset";
pub const OP_PAGED_RESULTS_COOKIE: &str = "pagedResultsCookie";
pub const OP_INCLUDE_TOMBSTONES: &str = "includeTombstones";
pub const OP_RUN_AS_USER: &str = "runAsUser";
pub const OP_RUN_WITH_PASSWORD: &str = "runWithPassword";
pub const OP_W2K_DOMAIN: &str = "w2k_domain";
pub const OP_RETURN_UID_ONLY: &str = "returnUidOnly";

/// Legacy raw-filter option keys, checked in this order.
pub const LEGACY_FILTER_KEYS: [&str; 2] = ["Search Filter String", "searchFilter"];

/// Depth of a search below its root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Only the root entry itself.
    Object,
    /// Immediate children of the root.
    OneLevel,
    /// The root and everything below it.
    #[default]
    Subtree,
}

impl SearchScope {
    /// Parse a scope option value. `base` is accepted as an alias of `object`.
    pub fn parse(value: &str) -> ConnectorResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "object" | "base" => Ok(SearchScope::Object),
            "onelevel" => Ok(SearchScope::OneLevel),
            "subtree" => Ok(SearchScope::Subtree),
            other => Err(ConnectorError::usage(format!(
                "unsupported search scope '{other}'"
            ))),
        }
    }
}

/// One sort key of a search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Attribute to sort on.
    pub attribute: String,
    /// Ascending when true.
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

impl SortKey {
    /// Ascending sort on `attribute`.
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: true,
        }
    }

    /// Descending sort on `attribute`.
    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: false,
        }
    }
}

/// Options accompanying a connector operation.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes_to_get: Option<Vec<String>>,
    /// Raw scope text; validated by the search that consumes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paged_results_offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paged_results_cookie: Option<String>,
    #[serde(default)]
    pub include_tombstones: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_with_password: Option<String>,
    /// Every option not covered by a typed field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl std::fmt::Debug for OperationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationOptions")
            .field("attributes_to_get", &self.attributes_to_get)
            .field("scope", &self.scope)
            .field("container", &self.container)
            .field("sort_keys", &self.sort_keys)
            .field("page_size", &self.page_size)
            .field("paged_results_offset", &self.paged_results_offset)
            .field("paged_results_cookie", &self.paged_results_cookie)
            .field("include_tombstones", &self.include_tombstones)
            .field("run_as_user", &self.run_as_user)
            .field(
                "run_with_password",
                &self.run_with_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OperationOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build typed options from the wire form (option name → JSON value).
    ///
    /// Known names with a value of the wrong shape are usage errors.
    pub fn from_map(map: BTreeMap<String, Value>) -> ConnectorResult<Self> {
        let mut options = Self::default();
        for (name, value) in map {
            match name.as_str() {
                OP_ATTRIBUTES_TO_GET => {
                    options.attributes_to_get = Some(string_list(&name, &value)?);
                }
                OP_SCOPE => options.scope = Some(string_value(&name, &value)?),
                OP_CONTAINER => options.container = Some(string_value(&name, &value)?),
                OP_SORT_KEYS => {
                    options.sort_keys = serde_json::from_value(value).map_err(|e| {
                        ConnectorError::usage(format!("invalid {OP_SORT_KEYS}: {e}"))
                    })?;
                }
                OP_PAGE_SIZE => options.page_size = Some(u32_value(&name, &value)?),
                OP_PAGED_RESULTS_OFFSET => {
                    options.paged_results_offset = Some(u32_value(&name, &value)?);
                }
                OP_PAGED_RESULTS_COOKIE => {
                    options.paged_results_cookie = Some(string_value(&name, &value)?);
                }
                OP_INCLUDE_TOMBSTONES => {
                    options.include_tombstones = value.as_bool().ok_or_else(|| {
                        ConnectorError::usage(format!("{OP_INCLUDE_TOMBSTONES} must be a boolean"))
                    })?;
                }
                OP_RUN_AS_USER => options.run_as_user = Some(string_value(&name, &value)?),
                OP_RUN_WITH_PASSWORD => {
                    options.run_with_password = Some(string_value(&name, &value)?);
                }
                _ => {
                    options.extra.insert(name, value);
                }
            }
        }
        Ok(options)
    }

    /// Look up an untyped option as a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    /// Look up an untyped option as a boolean. Accepts `true`/`false` and the
    /// strings `"true"`/`"false"`.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.extra.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// First non-empty legacy raw filter, with the key it came from.
    pub fn legacy_filter(&self) -> Option<(&'static str, &str)> {
        LEGACY_FILTER_KEYS.iter().find_map(|key| {
            self.get_str(key)
                .filter(|text| !text.trim().is_empty())
                .map(|text| (*key, text))
        })
    }

    #[must_use]
    pub fn with_attributes_to_get<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes_to_get = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    #[must_use]
    pub fn with_sort_key(mut self, key: SortKey) -> Self {
        self.sort_keys.push(key);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_paged_results_offset(mut self, offset: u32) -> Self {
        self.paged_results_offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_paged_results_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.paged_results_cookie = Some(cookie.into());
        self
    }

    #[must_use]
    pub fn with_include_tombstones(mut self, include: bool) -> Self {
        self.include_tombstones = include;
        self
    }

    #[must_use]
    pub fn with_run_as(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.run_as_user = Some(user.into());
        self.run_with_password = Some(password.into());
        self
    }

    /// Set an untyped option.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

fn string_value(name: &str, value: &Value) -> ConnectorResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConnectorError::usage(format!("{name} must be a string")))
}

fn string_list(name: &str, value: &Value) -> ConnectorResult<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| ConnectorError::usage(format!("{name} must be a list of strings")))?;
    items.iter().map(|item| string_value(name, item)).collect()
}

fn u32_value(name: &str, value: &Value) -> ConnectorResult<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ConnectorError::usage(format!("{name} must be a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!(SearchScope::parse("object").unwrap(), SearchScope::Object);
        assert_eq!(SearchScope::parse("base").unwrap(), SearchScope::Object);
        assert_eq!(SearchScope::parse("OneLevel").unwrap(), SearchScope::OneLevel);
        assert_eq!(SearchScope::parse("subtree").unwrap(), SearchScope::Subtree);
        assert!(SearchScope::parse("children").is_err());
        assert_eq!(SearchScope::default(), SearchScope::Subtree);
    }

    #[test]
    fn test_from_map_typed_fields() {
        let options = OperationOptions::from_map(wire(json!({
            "attributesToGet": ["cn", "mail"],
            "scope": "onelevel",
            "sortKeys": [{"attribute": "sn", "ascending": false}],
            "pageSize": 10,
            "pagedResultsOffset": 3,
            "includeTombstones": true,
            "w2k_domain": "CORP"
        })))
        .unwrap();

        assert_eq!(
            options.attributes_to_get,
            Some(vec!["cn".to_string(), "mail".to_string()])
        );
        assert_eq!(options.scope.as_deref(), Some("onelevel"));
        assert_eq!(options.sort_keys, vec![SortKey::descending("sn")]);
        assert_eq!(options.page_size, Some(10));
        assert_eq!(options.paged_results_offset, Some(3));
        assert!(options.include_tombstones);
        assert_eq!(options.get_str(OP_W2K_DOMAIN), Some("CORP"));
    }

    #[test]
    fn test_from_map_rejects_bad_shapes() {
        assert!(OperationOptions::from_map(wire(json!({"pageSize": "ten"}))).is_err());
        assert!(OperationOptions::from_map(wire(json!({"pageSize": -1}))).is_err());
        assert!(OperationOptions::from_map(wire(json!({"attributesToGet": "cn"}))).is_err());
        assert!(OperationOptions::from_map(wire(json!({"sortKeys": 5}))).is_err());
    }

    #[test]
    fn test_legacy_filter_precedence() {
        let options = OperationOptions::new()
            .with_option("searchFilter", "(cn=b)")
            .with_option("Search Filter String", "(cn=a)");
        assert_eq!(
            options.legacy_filter(),
            Some(("Search Filter String", "(cn=a)"))
        );

        let options = OperationOptions::new()
            .with_option("Search Filter String", "  ")
            .with_option("searchFilter", "(cn=b)");
        assert_eq!(options.legacy_filter(), Some(("searchFilter", "(cn=b)")));
        assert_eq!(OperationOptions::new().legacy_filter(), None);
    }

    #[test]
    fn test_bool_lookup() {
        let options = OperationOptions::new()
            .with_option(OP_RETURN_UID_ONLY, true)
            .with_option("flag", "false");
        assert_eq!(options.get_bool(OP_RETURN_UID_ONLY), Some(true));
        assert_eq!(options.get_bool("flag"), Some(false));
        assert_eq!(options.get_bool("missing"), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let options = OperationOptions::new().with_run_as("admin", "s3cret");
        let debug = format!("{options:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("s3cret"));
    }
}
