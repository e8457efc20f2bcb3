//! Create, update and delete.
//!
//! Creation is two-phase: a minimal entry (RDN and object class) is added
//! first, then every other attribute is applied as a replace. Once the
//! minimal entry exists, any failure removes it again before the error is
//! returned.

use std::sync::Arc;

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::object::ObjectClass;
use dirsync_connector::operation::{
    AttributeSet, AttributeValue, Uid, UpdateType, ENABLE_ATTRIBUTE, NAME_ATTRIBUTE,
    PASSWORD_ATTRIBUTE, UID_ATTRIBUTE,
};
use tracing::{debug, info, warn};

use crate::account;
use crate::directory::{Connection, EntryPath, LazyConnection, Modification, RawEntry};
use crate::dn;
use crate::guid;
use crate::schema::{self, ClassInfo, DeletePolicy, Schema, AD_CONTAINER, GROUP_TYPE, OBJECT_GUID};

const OBJECT_CLASS: &str = "objectClass";

/// Whether an update carries nothing but the identifier.
pub fn is_identifier_only(attributes: &AttributeSet) -> bool {
    attributes
        .names()
        .all(|name| name.eq_ignore_ascii_case(UID_ATTRIBUTE))
}

/// Applies mutations through one domain controller connection, opened on
/// first use.
pub struct Mutator<'a> {
    connection: LazyConnection<'a>,
    schema: &'a Schema,
    secure: bool,
}

impl<'a> Mutator<'a> {
    /// `secure` tells whether the channel is encrypted, which password
    /// writes require.
    pub fn new(connection: LazyConnection<'a>, schema: &'a Schema, secure: bool) -> Self {
        Self {
            connection,
            schema,
            secure,
        }
    }

    fn open(&mut self, operation: &str, target: &str) -> ConnectorResult<Arc<dyn Connection>> {
        self.connection
            .get()
            .map_err(|e| e.into_connector_error(operation, target))
    }

    /// Create an entry named by `__NAME__` and return its identifier.
    pub fn create(
        &mut self,
        object_class: &ObjectClass,
        attributes: &AttributeSet,
    ) -> ConnectorResult<Uid> {
        let name = attributes
            .get(NAME_ATTRIBUTE)
            .and_then(AttributeValue::as_string)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ConnectorError::usage("the __NAME__ attribute is required"))?
            .to_string();
        let parent = dn::parent_dn(&name)
            .ok_or_else(|| ConnectorError::usage(format!("'{name}' has no parent container")))?
            .to_string();
        let (rdn_attribute, rdn_value) = dn::rdn_parts(dn::relative_name(&name))
            .ok_or_else(|| ConnectorError::usage(format!("'{name}' is not a distinguished name")))?;
        let class = self.schema.class(object_class);

        let connection = self.open("create", &name)?;
        if !connection
            .exists(&parent)
            .map_err(|e| e.into_connector_error("create", &name))?
        {
            return Err(ConnectorError::operation_failed(
                "create",
                &name,
                format!("container {parent} does not exist"),
            ));
        }

        let mut minimal = vec![
            (rdn_attribute.to_string(), vec![rdn_value.clone().into_bytes()]),
            (OBJECT_CLASS.to_string(), vec![class.native_class.clone().into_bytes()]),
        ];
        if *object_class == ObjectClass::Group {
            if let Some(group_type) = attributes
                .get(GROUP_TYPE)
                .and_then(AttributeValue::as_integer)
            {
                minimal.push((GROUP_TYPE.to_string(), vec![group_type.to_string().into_bytes()]));
            }
        }
        debug!(dn = %name, class = %class.native_class, "Adding minimal entry");
        connection
            .add(&name, minimal)
            .map_err(|e| e.into_connector_error("create", &name))?;

        let completed = self.complete_create(
            &*connection,
            object_class,
            &class,
            &name,
            (rdn_attribute, &rdn_value),
            attributes,
        );
        match completed {
            Ok(uid) => {
                info!(dn = %name, uid = %uid, "Entry created");
                Ok(uid)
            }
            Err(e) => {
                warn!(dn = %name, error = %e, "Create failed after the entry was added; removing it");
                if let Err(cleanup) = connection.delete_tree(&name) {
                    warn!(dn = %name, error = %cleanup, "Could not remove partially created entry");
                }
                Err(e)
            }
        }
    }

    fn complete_create(
        &self,
        connection: &dyn Connection,
        object_class: &ObjectClass,
        class: &ClassInfo,
        name: &str,
        (rdn_attribute, rdn_value): (&str, &str),
        attributes: &AttributeSet,
    ) -> ConnectorResult<Uid> {
        let mut attributes = attributes.clone();
        if class.disabled_on_create && attributes.get(ENABLE_ATTRIBUTE).is_none() {
            attributes.set(ENABLE_ATTRIBUTE, true);
        }
        let current = self.read(connection, &EntryPath::Dn(name.to_string()), "create", name)?;
        let changes = self.changes(object_class, UpdateType::Replace, &attributes, &current, true)?;
        let modifications: Vec<Modification> = changes
            .modifications
            .into_iter()
            .filter(|m| {
                !matches!(m, Modification::Replace(attribute, values)
                    if attribute.eq_ignore_ascii_case(rdn_attribute)
                        && values.len() == 1
                        && values[0].eq_ignore_ascii_case(rdn_value.as_bytes()))
            })
            .collect();
        if !modifications.is_empty() {
            connection
                .modify(name, modifications)
                .map_err(|e| e.into_connector_error("create", name))?;
        }

        let created = self.read(connection, &EntryPath::Dn(name.to_string()), "create", name)?;
        let guid = created.first(OBJECT_GUID).ok_or_else(|| {
            ConnectorError::operation_failed("create", name, "created entry has no objectGUID")
        })?;
        if let Some(registry) = guid::to_registry_form(guid) {
            debug!(dn = %name, guid = %registry, "Read back objectGUID");
        }
        Ok(Uid::from_value(guid::to_uid_value(guid)))
    }

    /// Apply `attributes` to the entry `uid` according to `update_type`.
    pub fn update(
        &mut self,
        object_class: &ObjectClass,
        uid: &Uid,
        update_type: UpdateType,
        attributes: &AttributeSet,
    ) -> ConnectorResult<Uid> {
        if uid.is_empty() {
            return Err(ConnectorError::usage("an identifier is required for update"));
        }
        if is_identifier_only(attributes) {
            debug!(uid = %uid, "Update carries only the identifier; nothing to do");
            return Ok(uid.clone());
        }
        let guid = guid::parse_uid(uid.value())?;
        let connection = self.open("update", uid.value())?;
        let current = self.read(&*connection, &EntryPath::Guid(guid), "update", uid.value())?;
        let target = current.dn.clone();
        debug!(dn = %target, class = %object_class, kind = %update_type, "Updating entry");

        let changes = self.changes(object_class, update_type, attributes, &current, false)?;
        let mut target_dn = target.clone();
        if let Some(new_name) = changes.rename {
            connection
                .rename(&target, &new_name)
                .map_err(|e| e.into_connector_error("update", &target))?;
            debug!(from = %target, to = %new_name, "Entry renamed");
            target_dn = new_name;
        }
        if !changes.modifications.is_empty() {
            connection
                .modify(&target_dn, changes.modifications)
                .map_err(|e| e.into_connector_error("update", &target_dn))?;
        }
        info!(dn = %target_dn, kind = %update_type, "Entry updated");
        Ok(uid.clone())
    }

    /// Delete the entry `uid`, with its subtree unless the class deletes leaves.
    pub fn delete(&mut self, object_class: &ObjectClass, uid: &Uid) -> ConnectorResult<()> {
        let guid = guid::parse_uid(uid.value())?;
        let connection = self.open("delete", uid.value())?;
        let current = self.read(&*connection, &EntryPath::Guid(guid), "delete", uid.value())?;
        let class = self.schema.class(object_class);
        let result = match class.delete_policy {
            DeletePolicy::Leaf => connection.delete(&current.dn),
            DeletePolicy::Subtree => connection.delete_tree(&current.dn),
        };
        result.map_err(|e| e.into_connector_error("delete", &current.dn))?;
        info!(dn = %current.dn, policy = ?class.delete_policy, "Entry deleted");
        Ok(())
    }

    /// Close the connection, if one was opened.
    pub fn release(&mut self) {
        self.connection.release();
    }

    fn read(
        &self,
        connection: &dyn Connection,
        path: &EntryPath,
        operation: &str,
        target: &str,
    ) -> ConnectorResult<RawEntry> {
        let attributes = [
            OBJECT_GUID.to_string(),
            account::USER_ACCOUNT_CONTROL.to_string(),
        ];
        connection
            .read(path, &attributes)
            .map_err(|e| e.into_connector_error(operation, target))?
            .ok_or_else(|| ConnectorError::not_found(target))
    }

    /// Translate attributes into directory changes.
    fn changes(
        &self,
        object_class: &ObjectClass,
        update_type: UpdateType,
        attributes: &AttributeSet,
        current: &RawEntry,
        creating: bool,
    ) -> ConnectorResult<Changes> {
        let mut changes = Changes::default();
        let mut enable: Option<bool> = None;
        let mut account_control: Option<i64> = None;

        for (name, value) in attributes.iter() {
            if name.eq_ignore_ascii_case(UID_ATTRIBUTE) {
                continue;
            }
            if name.eq_ignore_ascii_case(NAME_ATTRIBUTE) {
                if creating {
                    continue;
                }
                let new_name = value
                    .as_string()
                    .ok_or_else(|| ConnectorError::usage("__NAME__ must be a string"))?;
                if update_type != UpdateType::Replace {
                    return Err(ConnectorError::usage(format!(
                        "__NAME__ cannot be changed by a {update_type} update"
                    )));
                }
                if !dn::same_dn(new_name, &current.dn) {
                    changes.rename = Some(new_name.to_string());
                }
                continue;
            }
            if name.eq_ignore_ascii_case(ENABLE_ATTRIBUTE) {
                // Only accounts carry an enabled state.
                if *object_class != ObjectClass::Account {
                    debug!(class = %object_class, "Ignoring __ENABLE__");
                    continue;
                }
                enable = Some(value.as_boolean().ok_or_else(|| {
                    ConnectorError::usage("__ENABLE__ must be a boolean")
                })?);
                continue;
            }
            if name.eq_ignore_ascii_case(PASSWORD_ATTRIBUTE) {
                if update_type == UpdateType::Delete {
                    return Err(ConnectorError::usage("a password cannot be removed"));
                }
                account::require_secure_channel(self.secure)?;
                let password = value
                    .as_string()
                    .ok_or_else(|| ConnectorError::usage("__PASSWORD__ must be a string"))?;
                changes.modifications.push(Modification::Replace(
                    account::UNICODE_PWD.to_string(),
                    vec![account::encode_password(password)?],
                ));
                continue;
            }
            if name.eq_ignore_ascii_case(AD_CONTAINER) {
                debug!(attribute = %name, "Ignoring read-only attribute");
                continue;
            }
            if creating && name.eq_ignore_ascii_case(OBJECT_CLASS) {
                continue;
            }
            if name.eq_ignore_ascii_case(account::USER_ACCOUNT_CONTROL) && update_type == UpdateType::Replace {
                account_control = value.as_integer();
                if account_control.is_some() {
                    continue;
                }
            }

            let values = schema::to_native_values(value);
            match update_type {
                UpdateType::Add if values.is_empty() => {}
                UpdateType::Add => changes.modifications.push(Modification::Add(name.clone(), values)),
                UpdateType::Delete => changes.modifications.push(Modification::Delete(name.clone(), values)),
                UpdateType::Replace => changes.modifications.push(Modification::Replace(name.clone(), values)),
            }
        }

        let base = account_control.or_else(|| current.first_i64(account::USER_ACCOUNT_CONTROL));
        let flags = match (enable, base) {
            (Some(enabled), base) => Some(account::with_enabled(
                base.unwrap_or_else(account::default_new_account_flags),
                enabled,
            )),
            (None, Some(uac)) if account_control.is_some() => Some(uac),
            _ => None,
        };
        if let Some(flags) = flags {
            changes.modifications.push(Modification::Replace(
                account::USER_ACCOUNT_CONTROL.to_string(),
                vec![flags.to_string().into_bytes()],
            ));
        }
        Ok(changes)
    }
}

#[derive(Debug, Default)]
struct Changes {
    modifications: Vec<Modification>,
    rename: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Credentials, Endpoint, MemoryDirectory};

    const ROOT: &str = "DC=corp,DC=example";

    fn fixture() -> MemoryDirectory {
        let directory = MemoryDirectory::new("corp.example");
        directory.add_credentials("admin", "pw");
        directory
    }

    fn mutator<'a>(directory: &'a MemoryDirectory, schema: &'a Schema, secure: bool) -> Mutator<'a> {
        Mutator::new(
            LazyConnection::new(
                directory,
                Endpoint::domain_controller("corp.example"),
                Credentials::new("admin", "pw"),
            ),
            schema,
            secure,
        )
    }

    fn user_dn(name: &str) -> String {
        format!("CN={name},CN=Users,{ROOT}")
    }

    #[test]
    fn test_identifier_only_detection() {
        assert!(is_identifier_only(&AttributeSet::new()));
        assert!(is_identifier_only(&AttributeSet::new().with(UID_ATTRIBUTE, "<GUID=00>")));
        assert!(!is_identifier_only(&AttributeSet::new().with("mail", "a@x")));
    }

    #[test]
    fn test_create_account_is_enabled_by_default() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let attrs = AttributeSet::new()
            .with(NAME_ATTRIBUTE, user_dn("jdoe"))
            .with("cn", "jdoe")
            .with("sAMAccountName", "jdoe");

        let uid = m.create(&ObjectClass::Account, &attrs).unwrap();
        let entry = directory.entry(&user_dn("jdoe")).unwrap();
        assert_eq!(guid::to_uid_value(entry.first("objectGUID").unwrap()), uid.value());
        assert!(account::is_enabled(entry.first_i64("userAccountControl").unwrap()));
        assert_eq!(entry.first_str("sAMAccountName"), Some("jdoe"));
    }

    #[test]
    fn test_create_account_honors_explicit_disable() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let attrs = AttributeSet::new()
            .with(NAME_ATTRIBUTE, user_dn("off"))
            .with(ENABLE_ATTRIBUTE, false);
        m.create(&ObjectClass::Account, &attrs).unwrap();
        let entry = directory.entry(&user_dn("off")).unwrap();
        assert!(!account::is_enabled(entry.first_i64("userAccountControl").unwrap()));
    }

    #[test]
    fn test_create_requires_name_and_parent() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);

        let err = m.create(&ObjectClass::Account, &AttributeSet::new().with("cn", "x")).unwrap_err();
        assert!(err.is_caller_error());
        assert_eq!(directory.operation_count(), 0);

        let attrs = AttributeSet::new().with(NAME_ATTRIBUTE, format!("CN=x,OU=Missing,{ROOT}"));
        let err = m.create(&ObjectClass::Account, &attrs).unwrap_err();
        assert_eq!(err.error_code(), "OPERATION_FAILED");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_create_rolls_back_after_failure() {
        let directory = fixture();
        directory.reject_attribute("description");
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let attrs = AttributeSet::new()
            .with(NAME_ATTRIBUTE, user_dn("broken"))
            .with("description", "rejected");

        assert!(m.create(&ObjectClass::Account, &attrs).is_err());
        assert!(!directory.contains(&user_dn("broken")));
    }

    #[test]
    fn test_password_requires_secure_channel() {
        let directory = fixture();
        let schema = Schema::build("user");
        let attrs = AttributeSet::new()
            .with(NAME_ATTRIBUTE, user_dn("pw"))
            .with(PASSWORD_ATTRIBUTE, "S3cret!");

        let err = mutator(&directory, &schema, false)
            .create(&ObjectClass::Account, &attrs)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
        assert!(!directory.contains(&user_dn("pw")));

        mutator(&directory, &schema, true)
            .create(&ObjectClass::Account, &attrs)
            .unwrap();
        let entry = directory.entry(&user_dn("pw")).unwrap();
        assert_eq!(entry.first("unicodePwd"), Some(account::quoted_utf16("S3cret!").as_slice()));
    }

    #[test]
    fn test_update_kinds() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let uid = m
            .create(
                &ObjectClass::Account,
                &AttributeSet::new()
                    .with(NAME_ATTRIBUTE, user_dn("u"))
                    .with("otherTelephone", vec!["1", "2"]),
            )
            .unwrap();

        m.update(&ObjectClass::Account, &uid, UpdateType::Add, &AttributeSet::new().with("otherTelephone", vec!["3"]))
            .unwrap();
        m.update(&ObjectClass::Account, &uid, UpdateType::Delete, &AttributeSet::new().with("otherTelephone", vec!["1"]))
            .unwrap();
        m.update(&ObjectClass::Account, &uid, UpdateType::Replace, &AttributeSet::new().with("title", "Boss"))
            .unwrap();

        let entry = directory.entry(&user_dn("u")).unwrap();
        let phones: Vec<&[u8]> = entry
            .values("otherTelephone")
            .unwrap()
            .iter()
            .map(Vec::as_slice)
            .collect();
        assert_eq!(phones, vec![b"2".as_slice(), b"3".as_slice()]);
        assert_eq!(entry.first_str("title"), Some("Boss"));
    }

    #[test]
    fn test_update_renames_on_name_replace() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let uid = m
            .create(&ObjectClass::Account, &AttributeSet::new().with(NAME_ATTRIBUTE, user_dn("old")))
            .unwrap();

        let attrs = AttributeSet::new()
            .with(NAME_ATTRIBUTE, user_dn("new"))
            .with("title", "Moved");
        let returned = m.update(&ObjectClass::Account, &uid, UpdateType::Replace, &attrs).unwrap();
        assert_eq!(returned, uid);
        assert!(!directory.contains(&user_dn("old")));
        assert_eq!(directory.entry(&user_dn("new")).unwrap().first_str("title"), Some("Moved"));
    }

    #[test]
    fn test_update_identifier_only_touches_nothing() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let uid = Uid::from_value("<GUID=000102030405060708090a0b0c0d0e0f>");
        let attrs = AttributeSet::new().with(UID_ATTRIBUTE, uid.value());

        let returned = m.update(&ObjectClass::Account, &uid, UpdateType::Replace, &attrs).unwrap();
        assert_eq!(returned, uid);
        assert_eq!(directory.connections_opened(), 0);
        assert_eq!(directory.operation_count(), 0);
    }

    #[test]
    fn test_update_errors() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let attrs = AttributeSet::new().with("title", "x");

        let err = m
            .update(&ObjectClass::Account, &Uid::from_value(""), UpdateType::Replace, &attrs)
            .unwrap_err();
        assert!(err.is_caller_error());

        let missing = Uid::from_value("<GUID=ffffffffffffffffffffffffffffffff>");
        let err = m
            .update(&ObjectClass::Account, &missing, UpdateType::Replace, &attrs)
            .unwrap_err();
        assert_eq!(err.error_code(), "OBJECT_NOT_FOUND");
    }

    #[test]
    fn test_update_enable_keeps_other_flags() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let uid = m
            .create(&ObjectClass::Account, &AttributeSet::new().with(NAME_ATTRIBUTE, user_dn("flags")))
            .unwrap();

        m.update(&ObjectClass::Account, &uid, UpdateType::Replace, &AttributeSet::new().with(ENABLE_ATTRIBUTE, false))
            .unwrap();
        let uac = directory.entry(&user_dn("flags")).unwrap().first_i64("userAccountControl").unwrap();
        assert_eq!(uac & account::ACCOUNTDISABLE, account::ACCOUNTDISABLE);
        assert_eq!(uac & account::NORMAL_ACCOUNT, account::NORMAL_ACCOUNT);
    }

    #[test]
    fn test_enable_is_ignored_outside_accounts() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let group_dn = format!("CN=Staff,CN=Users,{ROOT}");
        let uid = m
            .create(
                &ObjectClass::Group,
                &AttributeSet::new()
                    .with(NAME_ATTRIBUTE, group_dn.as_str())
                    .with(ENABLE_ATTRIBUTE, true),
            )
            .unwrap();
        m.update(&ObjectClass::Group, &uid, UpdateType::Replace, &AttributeSet::new().with(ENABLE_ATTRIBUTE, false))
            .unwrap();

        let entry = directory.entry(&group_dn).unwrap();
        assert!(!entry.has("userAccountControl"));
    }

    #[test]
    fn test_delete_policies() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let ou = m
            .create(
                &ObjectClass::OrganizationalUnit,
                &AttributeSet::new().with(NAME_ATTRIBUTE, format!("OU=Sales,{ROOT}")),
            )
            .unwrap();
        let member = m
            .create(
                &ObjectClass::Account,
                &AttributeSet::new().with(NAME_ATTRIBUTE, format!("CN=rep,OU=Sales,{ROOT}")),
            )
            .unwrap();

        m.delete(&ObjectClass::Account, &member).unwrap();
        assert!(!directory.contains(&format!("CN=rep,OU=Sales,{ROOT}")));
        m.delete(&ObjectClass::OrganizationalUnit, &ou).unwrap();
        assert!(!directory.contains(&format!("OU=Sales,{ROOT}")));

        let err = m.delete(&ObjectClass::Account, &member).unwrap_err();
        assert_eq!(err.error_code(), "OBJECT_NOT_FOUND");
    }

    #[test]
    fn test_delete_maps_access_denied() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        let uid = m
            .create(&ObjectClass::Account, &AttributeSet::new().with(NAME_ATTRIBUTE, user_dn("ro")))
            .unwrap();
        directory.set_read_only(true);
        let err = m.delete(&ObjectClass::Account, &uid).unwrap_err();
        assert_eq!(err.error_code(), "PERMISSION_DENIED");

        m.release();
        assert_eq!(directory.open_connections(), 0);
    }

    #[test]
    fn test_connection_opened_once_per_mutator() {
        let directory = fixture();
        let schema = Schema::build("user");
        let mut m = mutator(&directory, &schema, false);
        m.create(&ObjectClass::Account, &AttributeSet::new().with(NAME_ATTRIBUTE, user_dn("a")))
            .unwrap();
        m.create(&ObjectClass::Account, &AttributeSet::new().with(NAME_ATTRIBUTE, user_dn("b")))
            .unwrap();
        assert_eq!(directory.connections_opened(), 1);
        drop(m);
        assert_eq!(directory.open_connections(), 0);
    }
}
