//! Identifiers and attribute payloads
//!
//! Directory attribute names are case-insensitive, so [`AttributeSet`] is
//! too: `givenName`, `givenname` and `GIVENNAME` address one attribute, and
//! the spelling written last is the one reported back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Operational attribute carrying the object's unique identifier.
pub const UID_ATTRIBUTE: &str = "__UID__";
/// Operational attribute carrying the object's name (its distinguished name).
pub const NAME_ATTRIBUTE: &str = "__NAME__";
/// Operational attribute toggling the account enabled state.
pub const ENABLE_ATTRIBUTE: &str = "__ENABLE__";
/// Operational attribute carrying a new password.
pub const PASSWORD_ATTRIBUTE: &str = "__PASSWORD__";

/// Stable identifier of a directory object, e.g. `<GUID=...>`.
///
/// Survives renames and moves; the name does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute name to value, ordered by lowercased name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, AttributeValue>",
    into = "BTreeMap<String, AttributeValue>"
)]
pub struct AttributeSet {
    // lowercased name -> (name as written, value)
    entries: BTreeMap<String, (String, AttributeValue)>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, replacing any value stored under a differently cased name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Single string value of `name`.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_string)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Names as they were written.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.entries.values().map(|(name, value)| (name, value))
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeSet {
    fn from(map: BTreeMap<String, AttributeValue>) -> Self {
        let mut set = AttributeSet::new();
        for (name, value) in map {
            set.set(name, value);
        }
        set
    }
}

impl<N: Into<String>> FromIterator<(N, AttributeValue)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (N, AttributeValue)>>(iter: I) -> Self {
        let mut set = AttributeSet::new();
        set.extend(iter);
        set
    }
}

impl<N: Into<String>> Extend<(N, AttributeValue)> for AttributeSet {
    fn extend<I: IntoIterator<Item = (N, AttributeValue)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.set(name, value);
        }
    }
}

impl From<AttributeSet> for BTreeMap<String, AttributeValue> {
    fn from(set: AttributeSet) -> Self {
        set.entries.into_values().collect()
    }
}

/// Value of one attribute as the connector exchanges it.
///
/// Multi-valued attributes are an `Array` of single values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    String(String),
    Integer(i64),
    Boolean(bool),
    Binary(Vec<u8>),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_string(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        if let AttributeValue::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        if let AttributeValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        if let AttributeValue::Binary(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    pub fn as_array(&self) -> Option<&[AttributeValue]> {
        if let AttributeValue::Array(values) = self {
            Some(values)
        } else {
            None
        }
    }

    /// Every single value, with nested arrays flattened and nulls dropped.
    pub fn values(&self) -> Vec<&AttributeValue> {
        match self {
            AttributeValue::Null => vec![],
            AttributeValue::Array(values) => values.iter().flat_map(|v| v.values()).collect(),
            single => vec![single],
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Integer(i.into())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(bytes: Vec<u8>) -> Self {
        AttributeValue::Binary(bytes)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(values: Vec<&str>) -> Self {
        AttributeValue::Array(values.into_iter().map(AttributeValue::from).collect())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(values: Vec<String>) -> Self {
        AttributeValue::Array(values.into_iter().map(AttributeValue::from).collect())
    }
}

impl From<Vec<AttributeValue>> for AttributeValue {
    fn from(values: Vec<AttributeValue>) -> Self {
        AttributeValue::Array(values)
    }
}

/// How an update applies its values to the existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// Add values; existing values stay.
    Add,
    /// Remove exactly these values.
    Delete,
    /// Make these the only values.
    Replace,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Add => "add",
            UpdateType::Delete => "delete",
            UpdateType::Replace => "replace",
        }
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_is_transparent() {
        let uid = Uid::from_value("<GUID=0011>");
        assert_eq!(uid.value(), "<GUID=0011>");
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"<GUID=0011>\"");
        assert!(Uid::from_value("  ").is_empty());
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let mut attrs = AttributeSet::new()
            .with("givenName", "John")
            .with("GIVENNAME", "Jon")
            .with("sn", "Doe");

        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get_string("givenname"), Some("Jon"));
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["GIVENNAME", "sn"]);
        assert!(attrs.remove("GivenName").is_some());
        assert!(!attrs.has("givenName"));
    }

    #[test]
    fn test_collect_keeps_last_spelling() {
        let source = AttributeSet::new()
            .with("mail", "a@corp.example")
            .with("isDeleted", true);
        let mut attrs: AttributeSet = source
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("isdeleted"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        attrs.extend([("MAIL", AttributeValue::from("b@corp.example"))]);

        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_string("mail"), Some("b@corp.example"));
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["MAIL"]);
    }

    #[test]
    fn test_serde_uses_written_names() {
        let attrs = AttributeSet::new()
            .with("sAMAccountName", "jdoe")
            .with("otherTelephone", vec!["1", "2"]);
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"otherTelephone": ["1", "2"], "sAMAccountName": "jdoe"})
        );
        let back: AttributeSet = serde_json::from_value(json).unwrap();
        assert_eq!(back.get_string("samaccountname"), Some("jdoe"));
    }

    #[test]
    fn test_values_flatten() {
        let value = AttributeValue::Array(vec![
            AttributeValue::from("a"),
            AttributeValue::Array(vec![AttributeValue::from(7i64)]),
            AttributeValue::Null,
        ]);
        assert_eq!(
            value.values(),
            vec![&AttributeValue::from("a"), &AttributeValue::Integer(7)]
        );
        assert!(AttributeValue::Null.values().is_empty());
        assert_eq!(
            AttributeValue::from(vec![1u8, 2u8]).as_bytes(),
            Some(&[1u8, 2u8][..])
        );
    }

    #[test]
    fn test_update_type_names() {
        assert_eq!(
            serde_json::to_string(&UpdateType::Replace).unwrap(),
            "\"replace\""
        );
        assert_eq!(UpdateType::Delete.to_string(), "delete");
    }
}
