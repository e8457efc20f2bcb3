//! Attribute resolver: raw entries to normalized objects.
//!
//! When a search ran against the global catalog, live entries are re-read
//! from a domain controller because the replica may lack attributes or hold
//! stale values. The domain controller connection is opened on first use and
//! shared by every entry of the run.

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::object::{ConnectorObject, ObjectClass};
use dirsync_connector::operation::{
    AttributeSet, AttributeValue, Uid, ENABLE_ATTRIBUTE, NAME_ATTRIBUTE, PASSWORD_ATTRIBUTE,
    UID_ATTRIBUTE,
};
use tracing::debug;

use crate::account;
use crate::directory::{EntryPath, LazyConnection, RawEntry};
use crate::dn;
use crate::guid;
use crate::schema::{Schema, AD_CONTAINER, DISTINGUISHED_NAME, IS_DELETED, OBJECT_GUID, USN_CHANGED};

/// Directory attributes to fetch so that `requested` can be answered.
pub fn native_attributes(requested: &[String]) -> Vec<String> {
    let mut native: Vec<String> = vec![
        OBJECT_GUID.to_string(),
        DISTINGUISHED_NAME.to_string(),
        USN_CHANGED.to_string(),
        IS_DELETED.to_string(),
    ];
    for name in requested {
        let mapped = if name.eq_ignore_ascii_case(ENABLE_ATTRIBUTE) {
            account::USER_ACCOUNT_CONTROL
        } else if name.eq_ignore_ascii_case(UID_ATTRIBUTE)
            || name.eq_ignore_ascii_case(NAME_ATTRIBUTE)
            || name.eq_ignore_ascii_case(PASSWORD_ATTRIBUTE)
            || name.eq_ignore_ascii_case(AD_CONTAINER)
        {
            continue;
        } else {
            name.as_str()
        };
        if !native.iter().any(|n| n.eq_ignore_ascii_case(mapped)) {
            native.push(mapped.to_string());
        }
    }
    native
}

/// Builds normalized objects for one search run.
pub struct Resolver<'a> {
    schema: &'a Schema,
    object_class: ObjectClass,
    requested: Vec<String>,
    native: Vec<String>,
    authority: Option<LazyConnection<'a>>,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a Schema, object_class: ObjectClass, requested: Vec<String>) -> Self {
        let native = native_attributes(&requested);
        Self {
            schema,
            object_class,
            requested,
            native,
            authority: None,
        }
    }

    /// Entries come from a replica; re-read live ones from `authority`.
    #[must_use]
    pub fn with_authority(mut self, authority: LazyConnection<'a>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Directory attributes a search must return for this resolver.
    pub fn native_attributes(&self) -> &[String] {
        &self.native
    }

    /// Normalize one raw entry.
    pub fn resolve(&mut self, raw: &RawEntry) -> ConnectorResult<ConnectorObject> {
        let guid_bytes = raw.first(OBJECT_GUID).ok_or_else(|| {
            ConnectorError::operation_failed("resolve", &raw.dn, "entry has no objectGUID")
        })?;
        let uid = Uid::from_value(guid::to_uid_value(guid_bytes));
        let name = raw
            .first_str(DISTINGUISHED_NAME)
            .unwrap_or(&raw.dn)
            .to_string();

        if raw.is_deleted() {
            let mut attributes = AttributeSet::new();
            if let Some(values) = raw.values(USN_CHANGED) {
                attributes.set(USN_CHANGED, self.schema.to_attribute_value(USN_CHANGED, values));
            }
            return ConnectorObject::new(self.object_class.clone(), uid, name, attributes, true);
        }

        let authoritative = match self.authority.as_mut() {
            Some(authority) => {
                if !authority.is_open() {
                    debug!(endpoint = %authority.endpoint(), "Opening authoritative connection");
                }
                let connection = authority
                    .get()
                    .map_err(|e| e.into_connector_error("resolve", &name))?;
                let path = EntryPath::Dn(raw.dn.clone());
                match connection
                    .read(&path, &self.native)
                    .map_err(|e| e.into_connector_error("resolve", &name))?
                {
                    Some(entry) => Some(entry),
                    None => {
                        debug!(dn = %raw.dn, "Not on the domain controller; using the replica copy");
                        None
                    }
                }
            }
            None => None,
        };
        let source = authoritative.as_ref().unwrap_or(raw);

        let mut attributes = AttributeSet::new();
        for requested in &self.requested {
            if requested.eq_ignore_ascii_case(UID_ATTRIBUTE)
                || requested.eq_ignore_ascii_case(NAME_ATTRIBUTE)
                || requested.eq_ignore_ascii_case(PASSWORD_ATTRIBUTE)
            {
                continue;
            }
            if requested.eq_ignore_ascii_case(ENABLE_ATTRIBUTE) {
                if self.object_class != ObjectClass::Account {
                    continue;
                }
                if let Some(uac) = source.first_i64(account::USER_ACCOUNT_CONTROL) {
                    attributes.set(ENABLE_ATTRIBUTE, account::is_enabled(uac));
                }
                continue;
            }
            if requested.eq_ignore_ascii_case(AD_CONTAINER) {
                if let Some(parent) = dn::parent_dn(&name) {
                    attributes.set(AD_CONTAINER, parent);
                }
                continue;
            }
            // The replica's own USN is the one its sync cursor is measured in.
            let from = if requested.eq_ignore_ascii_case(USN_CHANGED) {
                raw
            } else {
                source
            };
            if let Some(values) = from.values(requested) {
                attributes.set(
                    requested.clone(),
                    self.schema.to_attribute_value(requested, values),
                );
            }
        }

        ConnectorObject::new(self.object_class.clone(), uid, name, attributes, false)
    }

    /// Release the authoritative connection, if any.
    pub fn release(&mut self) {
        if let Some(authority) = self.authority.as_mut() {
            authority.release();
        }
    }
}

/// `uSNChanged` of a normalized object.
pub fn usn_of(object: &ConnectorObject) -> Option<i64> {
    object
        .attributes()
        .get(USN_CHANGED)
        .and_then(AttributeValue::as_integer)
}
