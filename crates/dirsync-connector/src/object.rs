//! Connector objects, object classes and sync deltas.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};
use crate::operation::{AttributeSet, Uid};

/// The class of object an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ObjectClass {
    /// User accounts.
    Account,
    /// Groups.
    Group,
    /// Organizational units.
    OrganizationalUnit,
    /// Any other structural class, addressed by its directory name.
    Other(String),
}

impl ObjectClass {
    pub const ACCOUNT_NAME: &'static str = "__ACCOUNT__";
    pub const GROUP_NAME: &'static str = "__GROUP__";
    pub const ORGANIZATIONAL_UNIT_NAME: &'static str = "organizationalUnit";

    /// Framework name of the class.
    pub fn name(&self) -> &str {
        match self {
            ObjectClass::Account => Self::ACCOUNT_NAME,
            ObjectClass::Group => Self::GROUP_NAME,
            ObjectClass::OrganizationalUnit => Self::ORGANIZATIONAL_UNIT_NAME,
            ObjectClass::Other(name) => name,
        }
    }

    /// Whether this is the account class.
    pub fn is_account(&self) -> bool {
        matches!(self, ObjectClass::Account)
    }
}

impl From<String> for ObjectClass {
    fn from(name: String) -> Self {
        if name.eq_ignore_ascii_case(Self::ACCOUNT_NAME) {
            ObjectClass::Account
        } else if name.eq_ignore_ascii_case(Self::GROUP_NAME) {
            ObjectClass::Group
        } else if name.eq_ignore_ascii_case(Self::ORGANIZATIONAL_UNIT_NAME) {
            ObjectClass::OrganizationalUnit
        } else {
            ObjectClass::Other(name)
        }
    }
}

impl From<&str> for ObjectClass {
    fn from(name: &str) -> Self {
        ObjectClass::from(name.to_string())
    }
}

impl From<ObjectClass> for String {
    fn from(class: ObjectClass) -> Self {
        class.name().to_string()
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A normalized directory object handed to callers.
///
/// Only built through [`ConnectorObject::new`], which rejects an empty
/// identifier or name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorObject {
    object_class: ObjectClass,
    uid: Uid,
    name: String,
    attributes: AttributeSet,
    deleted: bool,
}

impl ConnectorObject {
    /// Create a normalized object.
    pub fn new(
        object_class: ObjectClass,
        uid: Uid,
        name: impl Into<String>,
        attributes: AttributeSet,
        deleted: bool,
    ) -> ConnectorResult<Self> {
        let name = name.into();
        if uid.is_empty() {
            return Err(ConnectorError::operation_failed(
                "build object",
                &name,
                "object has an empty identifier",
            ));
        }
        if name.is_empty() {
            return Err(ConnectorError::operation_failed(
                "build object",
                uid.value(),
                "object has an empty name",
            ));
        }
        Ok(Self {
            object_class,
            uid,
            name,
            attributes,
            deleted,
        })
    }

    pub fn object_class(&self) -> &ObjectClass {
        &self.object_class
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// The object's name, its distinguished name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Whether the object is a soft-deleted tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Opaque sync token a caller persists between sync calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change a sync delta reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDeltaType {
    CreateOrUpdate,
    Delete,
}

/// One change reported by sync, with the token to persist once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub token: SyncToken,
    pub delta_type: SyncDeltaType,
    pub object: ConnectorObject,
}

impl SyncDelta {
    pub fn uid(&self) -> &Uid {
        self.object.uid()
    }
}

/// Out-of-band results of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSummary {
    /// Advisory count of results after the delivered page; may be negative
    /// when the directory's estimate was low.
    pub remaining_paged_results: Option<i64>,
    /// Compatibility notes produced while building the query.
    pub diagnostics: Vec<String>,
    /// Entries that could not be resolved and were left out.
    #[serde(default)]
    pub skipped: u64,
}

/// Statistics of one sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Create-or-update deltas delivered.
    pub modified: u64,
    /// Delete deltas delivered.
    pub deleted: u64,
    /// Records that could not be turned into a delta.
    pub skipped: u64,
    /// Token after the last delivered delta, if any was delivered.
    pub token: Option<SyncToken>,
}
