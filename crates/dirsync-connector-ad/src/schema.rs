//! Object class policies and attribute syntaxes.
//!
//! [`Schema`] is a pure function of the configured account class, so a
//! connector computes it once and shares it.

use std::collections::HashMap;

use dirsync_connector::object::ObjectClass;
use dirsync_connector::operation::{AttributeValue, ENABLE_ATTRIBUTE};

/// Immutable `objectGUID`, exposed as `__UID__`.
pub const OBJECT_GUID: &str = "objectGUID";
/// Full DN, exposed as `__NAME__`.
pub const DISTINGUISHED_NAME: &str = "distinguishedName";
pub const USN_CHANGED: &str = "uSNChanged";
pub const IS_DELETED: &str = "isDeleted";
pub const GROUP_TYPE: &str = "groupType";
/// Read-only parent DN of an object.
pub const AD_CONTAINER: &str = "ad_container";

/// How values of an attribute are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syntax {
    String,
    Integer,
    Boolean,
    Binary,
    Dn,
}

/// Format: (name, syntax, multi_valued)
const ATTRIBUTE_SYNTAXES: &[(&str, Syntax, bool)] = &[
    ("cn", Syntax::String, false),
    ("sn", Syntax::String, false),
    ("givenName", Syntax::String, false),
    ("displayName", Syntax::String, false),
    ("description", Syntax::String, false),
    ("mail", Syntax::String, false),
    ("telephoneNumber", Syntax::String, false),
    ("otherTelephone", Syntax::String, true),
    ("title", Syntax::String, false),
    ("department", Syntax::String, false),
    ("company", Syntax::String, false),
    ("employeeID", Syntax::String, false),
    ("sAMAccountName", Syntax::String, false),
    ("userPrincipalName", Syntax::String, false),
    ("homeDirectory", Syntax::String, false),
    ("ou", Syntax::String, false),
    ("objectClass", Syntax::String, true),
    ("objectCategory", Syntax::Dn, false),
    ("distinguishedName", Syntax::Dn, false),
    ("manager", Syntax::Dn, false),
    ("managedBy", Syntax::Dn, false),
    ("member", Syntax::Dn, true),
    ("memberOf", Syntax::Dn, true),
    ("lastKnownParent", Syntax::Dn, false),
    ("uSNChanged", Syntax::Integer, false),
    ("uSNCreated", Syntax::Integer, false),
    ("groupType", Syntax::Integer, false),
    ("userAccountControl", Syntax::Integer, false),
    ("primaryGroupID", Syntax::Integer, false),
    ("badPwdCount", Syntax::Integer, false),
    ("logonCount", Syntax::Integer, false),
    ("accountExpires", Syntax::Integer, false),
    ("pwdLastSet", Syntax::Integer, false),
    ("lastLogon", Syntax::Integer, false),
    ("lockoutTime", Syntax::Integer, false),
    ("isDeleted", Syntax::Boolean, false),
    ("showInAdvancedViewOnly", Syntax::Boolean, false),
    ("objectGUID", Syntax::Binary, false),
    ("objectSid", Syntax::Binary, false),
    ("jpegPhoto", Syntax::Binary, false),
    ("thumbnailPhoto", Syntax::Binary, false),
];

const ACCOUNT_ATTRIBUTES: &[&str] = &[
    "sAMAccountName",
    "userPrincipalName",
    "cn",
    "givenName",
    "sn",
    "displayName",
    "description",
    "mail",
    "telephoneNumber",
    "title",
    "department",
    "company",
    "manager",
    "employeeID",
    "homeDirectory",
    "memberOf",
    "userAccountControl",
    ENABLE_ATTRIBUTE,
    AD_CONTAINER,
];

const GROUP_ATTRIBUTES: &[&str] = &[
    "cn",
    "sAMAccountName",
    "description",
    "mail",
    "groupType",
    "member",
    "managedBy",
    AD_CONTAINER,
];

const ORGANIZATIONAL_UNIT_ATTRIBUTES: &[&str] = &["ou", "description", "managedBy", AD_CONTAINER];

/// Whether a delete removes only the entry or its whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Leaf,
    Subtree,
}

/// Everything the engine needs to know about one object class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// The class name in the directory, e.g. `user`.
    pub native_class: String,
    /// Returned when the caller does not name attributes.
    pub default_attributes: Vec<String>,
    pub delete_policy: DeletePolicy,
    /// Searches without tombstones also require `objectCategory=Person`.
    pub person_category: bool,
    /// The directory creates these disabled unless told otherwise.
    pub disabled_on_create: bool,
    /// Supports sync and authenticate.
    pub is_principal: bool,
}

impl ClassInfo {
    fn new(native_class: &str, defaults: &[&str], delete_policy: DeletePolicy) -> Self {
        Self {
            native_class: native_class.to_string(),
            default_attributes: defaults.iter().map(|a| a.to_string()).collect(),
            delete_policy,
            person_category: false,
            disabled_on_create: false,
            is_principal: true,
        }
    }
}

/// Class policies plus attribute syntaxes.
#[derive(Debug, Clone)]
pub struct Schema {
    account: ClassInfo,
    group: ClassInfo,
    organizational_unit: ClassInfo,
    syntaxes: HashMap<String, (Syntax, bool)>,
}

impl Schema {
    /// Build for an account class such as `User` or `inetOrgPerson`.
    pub fn build(account_class: &str) -> Self {
        let account = ClassInfo {
            person_category: true,
            disabled_on_create: true,
            ..ClassInfo::new(
                &account_class.to_ascii_lowercase(),
                ACCOUNT_ATTRIBUTES,
                DeletePolicy::Leaf,
            )
        };
        let group = ClassInfo {
            is_principal: false,
            ..ClassInfo::new("group", GROUP_ATTRIBUTES, DeletePolicy::Subtree)
        };
        let organizational_unit = ClassInfo {
            is_principal: false,
            ..ClassInfo::new(
                "organizationalUnit",
                ORGANIZATIONAL_UNIT_ATTRIBUTES,
                DeletePolicy::Subtree,
            )
        };
        let syntaxes = ATTRIBUTE_SYNTAXES
            .iter()
            .map(|(name, syntax, multi)| (name.to_ascii_lowercase(), (*syntax, *multi)))
            .collect();
        Self {
            account,
            group,
            organizational_unit,
            syntaxes,
        }
    }

    pub fn class(&self, class: &ObjectClass) -> ClassInfo {
        match class {
            ObjectClass::Account => self.account.clone(),
            ObjectClass::Group => self.group.clone(),
            ObjectClass::OrganizationalUnit => self.organizational_unit.clone(),
            ObjectClass::Other(name) => ClassInfo::new(name, &[AD_CONTAINER], DeletePolicy::Subtree),
        }
    }

    /// Syntax and multi-valuedness; unknown attributes are single strings.
    pub fn syntax(&self, attribute: &str) -> (Syntax, bool) {
        self.syntaxes
            .get(&attribute.to_ascii_lowercase())
            .copied()
            .unwrap_or((Syntax::String, false))
    }

    /// Typed value for raw directory values.
    pub fn to_attribute_value(&self, attribute: &str, values: &[Vec<u8>]) -> AttributeValue {
        let (syntax, multi_valued) = self.syntax(attribute);
        let mut typed: Vec<AttributeValue> =
            values.iter().map(|raw| convert(syntax, raw)).collect();
        if multi_valued || typed.len() > 1 {
            AttributeValue::Array(typed)
        } else {
            typed.pop().unwrap_or(AttributeValue::Null)
        }
    }
}

fn convert(syntax: Syntax, raw: &[u8]) -> AttributeValue {
    if syntax == Syntax::Binary {
        return AttributeValue::Binary(raw.to_vec());
    }
    let Ok(text) = std::str::from_utf8(raw) else {
        return AttributeValue::Binary(raw.to_vec());
    };
    match syntax {
        Syntax::Integer => text
            .trim()
            .parse()
            .map_or_else(|_| AttributeValue::String(text.to_string()), AttributeValue::Integer),
        Syntax::Boolean if text.eq_ignore_ascii_case("TRUE") => AttributeValue::Boolean(true),
        Syntax::Boolean if text.eq_ignore_ascii_case("FALSE") => AttributeValue::Boolean(false),
        _ => AttributeValue::String(text.to_string()),
    }
}

/// Raw directory values for a typed value. Null yields no values.
pub fn to_native_values(value: &AttributeValue) -> Vec<Vec<u8>> {
    value
        .values()
        .into_iter()
        .filter_map(|v| match v {
            AttributeValue::String(s) => Some(s.clone().into_bytes()),
            AttributeValue::Integer(i) => Some(i.to_string().into_bytes()),
            AttributeValue::Boolean(true) => Some(b"TRUE".to_vec()),
            AttributeValue::Boolean(false) => Some(b"FALSE".to_vec()),
            AttributeValue::Binary(bytes) => Some(bytes.clone()),
            AttributeValue::Null | AttributeValue::Array(_) => None,
        })
        .collect()
}
