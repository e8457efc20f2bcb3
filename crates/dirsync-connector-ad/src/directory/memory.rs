//! In-process directory.
//!
//! [`MemoryDirectory`] behaves like a single Active Directory domain with one
//! domain controller (`dc1.<domain>`) and one global catalog
//! (`gc1.<domain>`):
//!
//! - every write stamps `uSNChanged` from a domain-wide counter
//! - deletes leave tombstones under `CN=Deleted Objects`
//! - searches honor scope, filter, server-side sort, VLV windows and the
//!   show-deleted control
//! - the global catalog can be made to lag: a partial attribute set, its own
//!   USN numbering, and entries the domain controller no longer has
//!
//! It also counts connections, result sets and calls, and can be told to
//! fail, so tests can assert on resource release and error paths.
//!
//! # Example
//!
//! ```ignore
//! use dirsync_connector_ad::directory::{
//!     Connection, Credentials, Directory, Endpoint, MemoryDirectory, RawEntry,
//! };
//!
//! let directory = MemoryDirectory::new("corp.example");
//! directory.add_credentials("administrator", "secret");
//! directory
//!     .insert(RawEntry::new("CN=jdoe,CN=Users,DC=corp,DC=example").with("objectClass", "user"))
//!     .unwrap();
//!
//! let creds = Credentials::new("administrator", "secret");
//! let conn = directory.open(&Endpoint::domain_controller("dc1.corp.example"), &creds).unwrap();
//! assert!(conn.exists("CN=jdoe,CN=Users,DC=corp,DC=example").unwrap());
//! conn.close();
//! assert_eq!(directory.open_connections(), 0);
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dirsync_connector::filter::Filter;
use dirsync_connector::options::SearchScope;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::{
    Connection, Credentials, Directory, Endpoint, EntryPath, Modification, NativeError,
    NativeErrorKind, NativeQuery, NativeResult, Paging, RawEntry, ResultSet, RootDse,
};
use crate::account;
use crate::dn;

const BITWISE_AND_RULE: &str = "1.2.840.113556.1.4.803";
const BITWISE_OR_RULE: &str = "1.2.840.113556.1.4.804";

/// Attributes a global catalog replicates for every object.
const REPLICA_BASE_ATTRIBUTES: [&str; 8] = [
    "objectclass",
    "objectguid",
    "objectcategory",
    "distinguishedname",
    "name",
    "usnchanged",
    "usncreated",
    "isdeleted",
];

/// Attributes a tombstone keeps.
const TOMBSTONE_ATTRIBUTES: [&str; 5] = [
    "objectclass",
    "objectguid",
    "objectsid",
    "samaccountname",
    "usncreated",
];

/// System-owned attributes no client may write.
const SYSTEM_ATTRIBUTES: [&str; 5] = [
    "objectguid",
    "distinguishedname",
    "usnchanged",
    "usncreated",
    "isdeleted",
];

const DEFAULT_SCHEMA_CLASSES: [&str; 11] = [
    "top",
    "domainDNS",
    "container",
    "organizationalUnit",
    "person",
    "organizationalPerson",
    "user",
    "inetOrgPerson",
    "computer",
    "contact",
    "group",
];

fn entry_attributes(entry: &RawEntry) -> Vec<(String, Vec<Vec<u8>>)> {
    entry
        .names()
        .filter_map(|name| entry.values(name).map(|v| (name.to_string(), v.to_vec())))
        .collect()
}

fn set_single(entry: &mut RawEntry, name: &str, value: impl Into<Vec<u8>>) {
    entry.remove(name);
    entry.push(name, [value.into()]);
}

fn string_values<'a>(entry: &'a RawEntry, attribute: &str) -> impl Iterator<Item = &'a str> {
    entry
        .values(attribute)
        .unwrap_or_default()
        .iter()
        .filter_map(|v| std::str::from_utf8(v).ok())
}

/// Numeric when both sides are integers, otherwise case-insensitive text.
fn compare_values(a: &str, b: &str) -> CmpOrdering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

fn value_equals(attribute: &str, stored: &str, wanted: &str) -> bool {
    if compare_values(stored, wanted) == CmpOrdering::Equal {
        return true;
    }
    // objectCategory holds a DN but is matched by the class's short name.
    attribute.eq_ignore_ascii_case("objectCategory")
        && dn::rdn_parts(dn::relative_name(stored))
            .is_some_and(|(_, short)| short.eq_ignore_ascii_case(wanted))
}

fn substring_matches(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    final_value: Option<&str>,
) -> bool {
    let value = value.to_lowercase();
    let mut rest = value.as_str();
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    match final_value {
        Some(f) => rest.ends_with(f.to_lowercase().as_str()),
        None => true,
    }
}

/// Evaluate a filter against an entry.
fn matches(filter: &Filter, entry: &RawEntry) -> bool {
    match filter {
        Filter::Equals { attribute, value } | Filter::Approx { attribute, value } => {
            entry
                .values(attribute)
                .unwrap_or_default()
                .iter()
                .any(|v| v.as_slice() == value.as_bytes())
                || string_values(entry, attribute).any(|v| value_equals(attribute, v, value))
        }
        Filter::EqualsBinary { attribute, value } => entry
            .values(attribute)
            .unwrap_or_default()
            .iter()
            .any(|v| v == value),
        Filter::Substring {
            attribute,
            initial,
            any,
            final_value,
        } => string_values(entry, attribute)
            .any(|v| substring_matches(v, initial.as_deref(), any, final_value.as_deref())),
        Filter::GreaterThanOrEquals { attribute, value } => {
            string_values(entry, attribute).any(|v| compare_values(v, value) != CmpOrdering::Less)
        }
        Filter::LessThanOrEquals { attribute, value } => string_values(entry, attribute)
            .any(|v| compare_values(v, value) != CmpOrdering::Greater),
        Filter::Present { attribute } => entry.has(attribute),
        Filter::Extensible {
            attribute,
            rule,
            value,
            ..
        } => {
            let mask = value.trim().parse::<i64>().ok();
            match (rule.as_deref(), mask) {
                (Some(BITWISE_AND_RULE), Some(mask)) => string_values(entry, attribute)
                    .filter_map(|v| v.trim().parse::<i64>().ok())
                    .any(|v| v & mask == mask),
                (Some(BITWISE_OR_RULE), Some(mask)) => string_values(entry, attribute)
                    .filter_map(|v| v.trim().parse::<i64>().ok())
                    .any(|v| v & mask != 0),
                _ => string_values(entry, attribute).any(|v| value_equals(attribute, v, value)),
            }
        }
        Filter::And { filters } => filters.iter().all(|f| matches(f, entry)),
        Filter::Or { filters } => filters.iter().any(|f| matches(f, entry)),
        Filter::Not { filter } => !matches(filter, entry),
    }
}

fn project(entry: &RawEntry, attributes: &[String]) -> RawEntry {
    if attributes.is_empty() || attributes.iter().any(|a| a == "*") {
        return entry.clone();
    }
    let mut out = RawEntry::new(entry.dn.clone());
    for name in attributes {
        if let Some(values) = entry.values(name) {
            out.push(name, values.to_vec());
        }
    }
    out
}

fn sort_entries(entries: &mut [(u64, RawEntry)], attribute: &str, ascending: bool) {
    entries.sort_by(|(_, a), (_, b)| {
        let ordering = match (string_values(a, attribute).next(), string_values(b, attribute).next())
        {
            (Some(x), Some(y)) => compare_values(x, y),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

/// Re-root `entry_dn`, which lies `levels` RDNs below its old base, under `new_base`.
fn rebase(entry_dn: &str, levels: usize, new_base: &str) -> String {
    let mut rdns = Vec::with_capacity(levels + 1);
    let mut rest = entry_dn;
    for _ in 0..levels {
        let (rdn, parent) = dn::split_rdn(rest);
        rdns.push(rdn.to_string());
        rest = parent;
    }
    rdns.push(new_base.to_string());
    rdns.join(",")
}

#[derive(Debug, Clone)]
struct Stored {
    order: u64,
    entry: RawEntry,
}

#[derive(Debug, Default)]
struct Replica {
    partial_attributes: Option<HashSet<String>>,
    usn_offset: i64,
    stale: BTreeMap<String, Stored>,
}

#[derive(Debug)]
struct State {
    domain: String,
    root: String,
    usn: i64,
    sequence: u64,
    entries: BTreeMap<String, Stored>,
    replica: Replica,
    schema_classes: HashSet<String>,
    servers: HashSet<String>,
    credentials: HashMap<String, String>,
    rejected_attributes: HashSet<String>,
    failing_reads: HashSet<String>,
    // parent key -> entries the server adds below it on creation
    dependents: HashMap<String, Vec<RawEntry>>,
    read_only: bool,
    open_connections: usize,
    connections_opened: usize,
    open_result_sets: usize,
    operations: usize,
    queries: Vec<NativeQuery>,
}

impl State {
    fn new(domain: &str) -> Self {
        let domain = domain.to_ascii_lowercase();
        Self {
            root: dn::domain_to_dn(&domain),
            servers: [
                domain.clone(),
                format!("dc1.{domain}"),
                format!("gc1.{domain}"),
            ]
            .into_iter()
            .collect(),
            domain,
            usn: 1000,
            sequence: 0,
            entries: BTreeMap::new(),
            replica: Replica::default(),
            schema_classes: DEFAULT_SCHEMA_CLASSES
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            credentials: HashMap::new(),
            rejected_attributes: HashSet::new(),
            failing_reads: HashSet::new(),
            dependents: HashMap::new(),
            read_only: false,
            open_connections: 0,
            connections_opened: 0,
            open_result_sets: 0,
            operations: 0,
            queries: Vec::new(),
        }
    }

    fn schema_naming_context(&self) -> String {
        format!("CN=Schema,CN=Configuration,{}", self.root)
    }

    fn deleted_objects(&self) -> String {
        format!("CN=Deleted Objects,{}", self.root)
    }

    fn next_usn(&mut self) -> i64 {
        self.usn += 1;
        self.usn
    }

    fn next_guid(&mut self) -> Vec<u8> {
        self.sequence += 1;
        let mut guid = Vec::with_capacity(16);
        guid.extend_from_slice(&self.sequence.to_le_bytes());
        guid.extend_from_slice(&[0xd1, 0x5e, 0xc7, 0x00, 0xad, 0x00, 0x00, 0x01]);
        guid
    }

    fn live(&self, key: &str) -> Option<&Stored> {
        self.entries.get(key).filter(|s| !s.entry.is_deleted())
    }

    fn check_writable(&self) -> NativeResult<()> {
        if self.read_only {
            return Err(NativeError::new(
                NativeErrorKind::InsufficientAccess,
                "write access denied",
            ));
        }
        Ok(())
    }

    fn check_attribute(&self, name: &str) -> NativeResult<()> {
        if self.rejected_attributes.contains(&name.to_ascii_lowercase()) {
            return Err(NativeError::from_result(
                19,
                format!("constraint violation on {name}"),
            ));
        }
        Ok(())
    }

    fn authenticate(&self, credentials: &Credentials) -> NativeResult<()> {
        let invalid = || NativeError::new(NativeErrorKind::InvalidCredentials, "invalid credentials");
        if let Some(password) = self.credentials.get(&credentials.username.to_ascii_lowercase()) {
            return if *password == credentials.password {
                Ok(())
            } else {
                Err(invalid())
            };
        }

        let username = credentials.username.as_str();
        let sam = match username.split_once('@') {
            Some((user, domain)) if domain.eq_ignore_ascii_case(&self.domain) => Some(user),
            Some(_) => None,
            None => username.split_once('\\').map(|(_, user)| user),
        };
        let entry = self
            .entries
            .values()
            .map(|s| &s.entry)
            .filter(|e| !e.is_deleted())
            .find(|e| {
                dn::same_dn(&e.dn, username)
                    || string_values(e, "userPrincipalName").any(|v| v.eq_ignore_ascii_case(username))
                    || sam.is_some_and(|sam| {
                        string_values(e, "sAMAccountName").any(|v| v.eq_ignore_ascii_case(sam))
                    })
            })
            .ok_or_else(invalid)?;

        let enabled = entry
            .first_i64(account::USER_ACCOUNT_CONTROL)
            .map_or(true, account::is_enabled);
        let password_matches = entry.first(account::UNICODE_PWD)
            == Some(account::quoted_utf16(&credentials.password).as_slice());
        if enabled && password_matches && !credentials.password.is_empty() {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    fn add(&mut self, entry_dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> NativeResult<Vec<u8>> {
        let key = dn::normalize(entry_dn);
        if self.entries.contains_key(&key) {
            return Err(NativeError::new(
                NativeErrorKind::AlreadyExists,
                format!("{entry_dn} already exists"),
            ));
        }
        if !dn::same_dn(entry_dn, &self.root) {
            let parent = dn::parent_dn(entry_dn).unwrap_or_default();
            if self.live(&dn::normalize(parent)).is_none() {
                return Err(NativeError::no_such_object(parent));
            }
        }

        let mut entry = RawEntry::new(entry_dn.trim());
        for (name, values) in attributes {
            self.check_attribute(&name)?;
            if SYSTEM_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(NativeError::from_result(19, format!("{name} is system-owned")));
            }
            entry.push(&name, values);
        }
        let classes: Vec<String> = string_values(&entry, "objectClass")
            .map(str::to_ascii_lowercase)
            .collect();
        if classes.is_empty() {
            return Err(NativeError::from_result(65, "objectClass is required"));
        }
        if let Some(unknown) = classes.iter().find(|c| !self.schema_classes.contains(*c)) {
            return Err(NativeError::from_result(65, format!("unknown class {unknown}")));
        }
        if !classes.iter().any(|c| c == "top") {
            let given = entry.remove("objectClass").unwrap_or_default();
            entry.push("objectClass", [b"top".to_vec()]);
            entry.push("objectClass", given);
        }

        let (rdn_attribute, rdn_value) = dn::rdn_parts(dn::relative_name(entry_dn))
            .ok_or_else(|| NativeError::from_result(34, format!("invalid DN {entry_dn}")))?;
        set_single(&mut entry, rdn_attribute, rdn_value.clone());
        set_single(&mut entry, "name", rdn_value);
        set_single(&mut entry, "distinguishedName", entry_dn.trim());

        if !entry.has("objectCategory") {
            let category = if classes.iter().any(|c| c == "user" || c == "inetorgperson") {
                "Person"
            } else if classes.iter().any(|c| c == "group") {
                "Group"
            } else if classes.iter().any(|c| c == "organizationalunit") {
                "Organizational-Unit"
            } else {
                classes.last().map_or("Top", String::as_str)
            };
            let category = format!("CN={category},{}", self.schema_naming_context());
            set_single(&mut entry, "objectCategory", category);
        }
        if classes.iter().any(|c| c == "user") && !entry.has(account::USER_ACCOUNT_CONTROL) {
            let flags = account::default_new_account_flags().to_string();
            set_single(&mut entry, account::USER_ACCOUNT_CONTROL, flags);
        }
        if classes.iter().any(|c| c == "group") && !entry.has("groupType") {
            set_single(&mut entry, "groupType", "-2147483646");
        }

        let guid = self.next_guid();
        let usn = self.next_usn().to_string();
        set_single(&mut entry, "objectGUID", guid.clone());
        set_single(&mut entry, "uSNCreated", usn.clone());
        set_single(&mut entry, "uSNChanged", usn);

        let order = self.sequence;
        self.entries.insert(key.clone(), Stored { order, entry });
        for child in self.dependents.remove(&key).unwrap_or_default() {
            self.add(&child.dn, entry_attributes(&child))?;
        }
        Ok(guid)
    }

    fn modify(&mut self, entry_dn: &str, modifications: Vec<Modification>) -> NativeResult<()> {
        let key = dn::normalize(entry_dn);
        for m in &modifications {
            self.check_attribute(m.attribute())?;
        }
        let mut entry = self
            .live(&key)
            .map(|s| s.entry.clone())
            .ok_or_else(|| NativeError::no_such_object(entry_dn))?;
        let (rdn_attribute, rdn_value) = dn::rdn_parts(dn::relative_name(&entry.dn))
            .map(|(a, v)| (a.to_string(), v))
            .unwrap_or_default();

        for m in modifications {
            let name = m.attribute().to_string();
            let lowered = name.to_ascii_lowercase();
            if SYSTEM_ATTRIBUTES.contains(&lowered.as_str()) {
                return Err(NativeError::from_result(19, format!("{name} is system-owned")));
            }
            if lowered == "name" || lowered.eq_ignore_ascii_case(&rdn_attribute) {
                let unchanged = matches!(&m, Modification::Replace(_, v)
                    if v.len() == 1 && v[0] == rdn_value.as_bytes());
                if !unchanged {
                    return Err(NativeError::from_result(67, format!("{name} is the naming attribute")));
                }
                continue;
            }
            match m {
                Modification::Add(_, values) => {
                    let mut current = entry.remove(&name).unwrap_or_default();
                    for value in values {
                        if current.contains(&value) {
                            return Err(NativeError::from_result(
                                20,
                                format!("{name} already has that value"),
                            ));
                        }
                        current.push(value);
                    }
                    entry.push(&name, current);
                }
                Modification::Delete(_, values) if values.is_empty() => {
                    if entry.remove(&name).is_none() {
                        return Err(NativeError::from_result(16, format!("no {name} to delete")));
                    }
                }
                Modification::Delete(_, values) => {
                    let mut current = entry.remove(&name).unwrap_or_default();
                    for value in values {
                        let position = current.iter().position(|v| *v == value).ok_or_else(|| {
                            NativeError::from_result(16, format!("{name} has no such value"))
                        })?;
                        current.remove(position);
                    }
                    entry.push(&name, current);
                }
                Modification::Replace(_, values) => {
                    entry.remove(&name);
                    entry.push(&name, values);
                }
            }
        }

        let usn = self.next_usn().to_string();
        set_single(&mut entry, "uSNChanged", usn);
        if let Some(stored) = self.entries.get_mut(&key) {
            stored.entry = entry;
        }
        Ok(())
    }

    fn has_live_children(&self, key: &str) -> bool {
        self.entries
            .iter()
            .any(|(k, s)| !s.entry.is_deleted() && dn::is_descendant(k, key))
    }

    /// Replace a live entry by its tombstone.
    fn tombstone(&mut self, key: &str) {
        let Some(stored) = self.entries.remove(key) else {
            return;
        };
        let original = stored.entry;
        let guid = original.first("objectGUID").unwrap_or_default().to_vec();
        let (_, rdn_value) =
            dn::rdn_parts(dn::relative_name(&original.dn)).unwrap_or(("", String::new()));
        let mangled = format!("{rdn_value}\nDEL:{}", hex::encode(&guid));
        let tomb_dn = format!("CN={},{}", dn::escape_dn_value(&mangled), self.deleted_objects());

        let mut tomb = RawEntry::new(tomb_dn.clone());
        for name in TOMBSTONE_ATTRIBUTES {
            if let Some(values) = original.values(name) {
                tomb.push(name, values.to_vec());
            }
        }
        tomb.push("isDeleted", [b"TRUE".to_vec()]);
        tomb.push("name", [mangled.into_bytes()]);
        tomb.push("distinguishedName", [tomb_dn.clone().into_bytes()]);
        if let Some(parent) = dn::parent_dn(&original.dn) {
            tomb.push("lastKnownParent", [parent.as_bytes().to_vec()]);
        }
        let usn = self.next_usn().to_string();
        tomb.push("uSNChanged", [usn.into_bytes()]);

        debug!(dn = %original.dn, "Entry tombstoned");
        self.entries.insert(
            dn::normalize(&tomb_dn),
            Stored {
                order: stored.order,
                entry: tomb,
            },
        );
    }

    fn delete(&mut self, entry_dn: &str, tree: bool) -> NativeResult<()> {
        let key = dn::normalize(entry_dn);
        if self.live(&key).is_none() {
            return Err(NativeError::no_such_object(entry_dn));
        }
        if tree {
            let mut below: Vec<String> = self
                .entries
                .iter()
                .filter(|(k, s)| !s.entry.is_deleted() && dn::is_descendant(k, &key))
                .map(|(k, _)| k.clone())
                .collect();
            below.sort_by_key(|k| std::cmp::Reverse(dn::depth(k)));
            for child in below {
                self.tombstone(&child);
            }
        } else if self.has_live_children(&key) {
            return Err(NativeError::new(
                NativeErrorKind::NotAllowedOnNonLeaf,
                format!("{entry_dn} has children"),
            ));
        }
        self.tombstone(&key);
        Ok(())
    }

    fn rename(&mut self, entry_dn: &str, new_dn: &str) -> NativeResult<()> {
        let key = dn::normalize(entry_dn);
        let new_key = dn::normalize(new_dn);
        if self.live(&key).is_none() {
            return Err(NativeError::no_such_object(entry_dn));
        }
        if key == new_key {
            return Ok(());
        }
        if self.entries.contains_key(&new_key) {
            return Err(NativeError::new(
                NativeErrorKind::AlreadyExists,
                format!("{new_dn} already exists"),
            ));
        }
        if dn::is_descendant(&new_key, &key) {
            return Err(NativeError::from_result(53, "cannot move an entry below itself"));
        }
        let new_parent = dn::parent_dn(new_dn).unwrap_or_default();
        if self.live(&dn::normalize(new_parent)).is_none() {
            return Err(NativeError::no_such_object(new_parent));
        }

        let base_depth = dn::depth(&key);
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|k| **k == key || dn::is_descendant(k, &key))
            .cloned()
            .collect();
        for old_key in moved {
            let Some(mut stored) = self.entries.remove(&old_key) else {
                continue;
            };
            let levels = dn::depth(&old_key) - base_depth;
            let moved_dn = rebase(&stored.entry.dn, levels, new_dn.trim());
            let mut entry = RawEntry::new(moved_dn.clone());
            for name in stored.entry.names() {
                if let Some(values) = stored.entry.values(name) {
                    entry.push(name, values.to_vec());
                }
            }
            set_single(&mut entry, "distinguishedName", moved_dn.clone());
            if levels == 0 {
                let (old_attribute, _) =
                    dn::rdn_parts(dn::relative_name(&stored.entry.dn)).unwrap_or(("", String::new()));
                entry.remove(old_attribute);
                if let Some((attribute, value)) = dn::rdn_parts(dn::relative_name(&moved_dn)) {
                    set_single(&mut entry, attribute, value.clone());
                    set_single(&mut entry, "name", value);
                }
                let usn = self.next_usn().to_string();
                set_single(&mut entry, "uSNChanged", usn);
            }
            stored.entry = entry;
            self.entries.insert(dn::normalize(&moved_dn), stored);
        }
        Ok(())
    }

    /// What a global catalog holds for an entry.
    fn replicate(&self, entry: &RawEntry) -> RawEntry {
        let mut copy = match &self.replica.partial_attributes {
            Some(partial) => {
                let mut copy = RawEntry::new(entry.dn.clone());
                for name in entry.names() {
                    if REPLICA_BASE_ATTRIBUTES.contains(&name) || partial.contains(name) {
                        if let Some(values) = entry.values(name) {
                            copy.push(name, values.to_vec());
                        }
                    }
                }
                copy
            }
            None => entry.clone(),
        };
        if self.replica.usn_offset != 0 {
            for name in ["uSNChanged", "uSNCreated"] {
                if let Some(usn) = copy.first_i64(name) {
                    set_single(&mut copy, name, (usn + self.replica.usn_offset).to_string());
                }
            }
        }
        copy
    }

    /// Entries visible through an endpoint, in creation order.
    fn view(&self, global_catalog: bool) -> Vec<(u64, RawEntry)> {
        let mut entries: Vec<(u64, RawEntry)> = if global_catalog {
            self.entries
                .values()
                .map(|s| (s.order, self.replicate(&s.entry)))
                .chain(self.replica.stale.values().map(|s| (s.order, s.entry.clone())))
                .collect()
        } else {
            self.entries
                .values()
                .map(|s| (s.order, s.entry.clone()))
                .collect()
        };
        entries.sort_by_key(|(order, _)| *order);
        entries
    }

    fn search(&mut self, global_catalog: bool, query: &NativeQuery) -> NativeResult<(Vec<RawEntry>, Option<i64>)> {
        self.queries.push(query.clone());
        let filter = Filter::parse(&query.filter)
            .map_err(|e| NativeError::from_result(87, e.to_string()))?;
        let base = if query.base.trim().is_empty() {
            self.root.clone()
        } else {
            query.base.clone()
        };
        let base_key = dn::normalize(&base);

        let view = self.view(global_catalog);
        if !view.iter().any(|(_, e)| dn::normalize(&e.dn) == base_key) {
            return Err(NativeError::no_such_object(&base));
        }

        let mut hits: Vec<(u64, RawEntry)> = view
            .into_iter()
            .filter(|(_, e)| {
                let key = dn::normalize(&e.dn);
                match query.scope {
                    SearchScope::Object => key == base_key,
                    SearchScope::OneLevel => dn::parent_dn(&key) == Some(base_key.as_str()),
                    SearchScope::Subtree => key == base_key || dn::is_descendant(&key, &base_key),
                }
            })
            .filter(|(_, e)| query.show_deleted || !e.is_deleted())
            .filter(|(_, e)| matches(&filter, e))
            .collect();

        if let Some(sort) = &query.sort {
            sort_entries(&mut hits, &sort.attribute, sort.ascending);
        }

        let (window, estimate) = match query.paging {
            Paging::Chunked { .. } => (hits, None),
            Paging::Vlv {
                before,
                after,
                offset,
            } => {
                let total = hits.len() as i64;
                let target = (offset.max(1) - 1) as usize;
                let start = target.saturating_sub(before as usize);
                let count = (before + after + 1) as usize;
                let window: Vec<_> = hits.into_iter().skip(start).take(count).collect();
                (window, Some(total))
            }
        };

        Ok((
            window
                .into_iter()
                .map(|(_, e)| project(&e, &query.attributes))
                .collect(),
            estimate,
        ))
    }

    fn read(
        &self,
        global_catalog: bool,
        path: &EntryPath,
        attributes: &[String],
    ) -> NativeResult<Option<RawEntry>> {
        let found = self.view(global_catalog).into_iter().find(|(_, e)| {
            !e.is_deleted()
                && match path {
                    EntryPath::Dn(target) => dn::same_dn(&e.dn, target),
                    EntryPath::Guid(guid) => e.first("objectGUID") == Some(guid.as_slice()),
                }
        });
        let Some((_, entry)) = found else {
            return Ok(None);
        };
        if !global_catalog && self.failing_reads.contains(&dn::normalize(&entry.dn)) {
            return Err(NativeError::new(
                NativeErrorKind::Other,
                format!("read of {} failed", entry.dn),
            ));
        }
        Ok(Some(project(&entry, attributes)))
    }
}

/// In-process [`Directory`]. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryDirectory {
    /// A domain with its root, `CN=Users` and `CN=Deleted Objects`.
    pub fn new(domain: &str) -> Self {
        let mut state = State::new(domain);
        let root = state.root.clone();
        let seeds = [
            (root.clone(), "domainDNS"),
            (format!("CN=Users,{root}"), "container"),
            (state.deleted_objects(), "container"),
        ];
        for (seed_dn, class) in seeds {
            if let Err(e) = state.add(&seed_dn, vec![("objectClass".to_string(), vec![class.as_bytes().to_vec()])]) {
                debug!(dn = %seed_dn, error = %e, "Seed entry rejected");
            }
        }
        let deleted = dn::normalize(&state.deleted_objects());
        if let Some(stored) = state.entries.get_mut(&deleted) {
            stored.entry.push("isDeleted", [b"TRUE".to_vec()]);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Accept a bind for a principal that is not an account entry.
    pub fn add_credentials(&self, username: &str, password: &str) {
        self.state
            .lock()
            .credentials
            .insert(username.to_ascii_lowercase(), password.to_string());
    }

    /// Make another host name reachable.
    pub fn add_server(&self, server: &str) {
        self.state.lock().servers.insert(server.to_ascii_lowercase());
    }

    /// Add an entry directly, returning its `objectGUID`.
    pub fn insert(&self, entry: RawEntry) -> NativeResult<Vec<u8>> {
        self.state.lock().add(&entry.dn, entry_attributes(&entry))
    }

    /// Create `child` as soon as `parent_dn` is added, the way the server
    /// populates default containers below some objects.
    pub fn add_on_create(&self, parent_dn: &str, child: RawEntry) {
        self.state
            .lock()
            .dependents
            .entry(dn::normalize(parent_dn))
            .or_default()
            .push(child);
    }

    /// Live entry by DN, as the domain controller holds it.
    pub fn entry(&self, entry_dn: &str) -> Option<RawEntry> {
        self.state
            .lock()
            .live(&dn::normalize(entry_dn))
            .map(|s| s.entry.clone())
    }

    pub fn contains(&self, entry_dn: &str) -> bool {
        self.entry(entry_dn).is_some()
    }

    /// Tombstones in deletion order.
    pub fn tombstones(&self) -> Vec<RawEntry> {
        let state = self.state.lock();
        let mut tombs: Vec<&RawEntry> = state
            .entries
            .values()
            .map(|s| &s.entry)
            .filter(|e| e.is_deleted() && e.has("objectGUID") && e.has("lastKnownParent"))
            .collect();
        tombs.sort_by_key(|e| e.first_i64("uSNChanged"));
        tombs.into_iter().cloned().collect()
    }

    pub fn highest_usn(&self) -> i64 {
        self.state.lock().usn
    }

    /// Restrict what the global catalog replicates to these attributes
    /// (plus the identity and USN attributes every replica carries).
    pub fn set_partial_attribute_set(&self, attributes: &[&str]) {
        self.state.lock().replica.partial_attributes =
            Some(attributes.iter().map(|a| a.to_ascii_lowercase()).collect());
    }

    /// Number the global catalog's USNs apart from the domain controller's.
    pub fn set_replica_usn_offset(&self, offset: i64) {
        self.state.lock().replica.usn_offset = offset;
    }

    /// An entry the global catalog still has but the domain controller does not.
    pub fn insert_replica_only(&self, mut entry: RawEntry) -> Vec<u8> {
        let mut state = self.state.lock();
        let guid = match entry.first("objectGUID") {
            Some(guid) => guid.to_vec(),
            None => {
                let guid = state.next_guid();
                entry.push("objectGUID", [guid.clone()]);
                guid
            }
        };
        if !entry.has("uSNChanged") {
            let usn = (state.next_usn() + state.replica.usn_offset).to_string();
            entry.push("uSNChanged", [usn.into_bytes()]);
        }
        if !entry.has("distinguishedName") {
            let dn_value = entry.dn.clone().into_bytes();
            entry.push("distinguishedName", [dn_value]);
        }
        state.sequence += 1;
        let order = state.sequence;
        state
            .replica
            .stale
            .insert(dn::normalize(&entry.dn), Stored { order, entry });
        guid
    }

    /// Fail every add or modify that touches `attribute`.
    pub fn reject_attribute(&self, attribute: &str) {
        self.state
            .lock()
            .rejected_attributes
            .insert(attribute.to_ascii_lowercase());
    }

    /// Fail domain controller reads of `entry_dn`.
    pub fn fail_reads_for(&self, entry_dn: &str) {
        self.state.lock().failing_reads.insert(dn::normalize(entry_dn));
    }

    /// Deny every write.
    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().read_only = read_only;
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    pub fn open_result_sets(&self) -> usize {
        self.state.lock().open_result_sets
    }

    /// Calls made on connections so far.
    pub fn operation_count(&self) -> usize {
        self.state.lock().operations
    }

    /// Every query run so far, oldest first.
    pub fn queries(&self) -> Vec<NativeQuery> {
        self.state.lock().queries.clone()
    }

    fn locate(&self, domain: &str, credentials: &Credentials, host: &str) -> NativeResult<String> {
        let state = self.state.lock();
        if !domain.eq_ignore_ascii_case(&state.domain) {
            return Err(NativeError::new(
                NativeErrorKind::Unavailable,
                format!("no servers found for {domain}"),
            ));
        }
        state.authenticate(credentials)?;
        Ok(format!("{host}.{}", state.domain))
    }
}

impl Directory for MemoryDirectory {
    fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> NativeResult<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        if !state.servers.contains(&endpoint.server.to_ascii_lowercase()) {
            return Err(NativeError::new(
                NativeErrorKind::Unavailable,
                format!("{endpoint} is not reachable"),
            ));
        }
        state.authenticate(credentials)?;
        state.open_connections += 1;
        state.connections_opened += 1;
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            endpoint: endpoint.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn find_domain_controller(
        &self,
        domain: &str,
        credentials: &Credentials,
    ) -> NativeResult<String> {
        self.locate(domain, credentials, "dc1")
    }

    fn find_global_catalog(&self, domain: &str, credentials: &Credentials) -> NativeResult<String> {
        self.locate(domain, credentials, "gc1")
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
    endpoint: Endpoint,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn begin(&self) -> NativeResult<MutexGuard<'_, State>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NativeError::new(
                NativeErrorKind::Unavailable,
                "connection is closed",
            ));
        }
        let mut state = self.state.lock();
        state.operations += 1;
        Ok(state)
    }

    fn begin_write(&self) -> NativeResult<MutexGuard<'_, State>> {
        let state = self.begin()?;
        state.check_writable()?;
        Ok(state)
    }
}

impl Connection for MemoryConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn search(&self, query: &NativeQuery) -> NativeResult<Box<dyn ResultSet>> {
        let mut state = self.begin()?;
        let (entries, estimate) = state.search(self.endpoint.global_catalog, query)?;
        state.open_result_sets += 1;
        Ok(Box::new(MemoryResultSet {
            state: Arc::clone(&self.state),
            entries: entries.into(),
            estimate,
            closed: false,
        }))
    }

    fn read(&self, path: &EntryPath, attributes: &[String]) -> NativeResult<Option<RawEntry>> {
        self.begin()?
            .read(self.endpoint.global_catalog, path, attributes)
    }

    fn exists(&self, entry_dn: &str) -> NativeResult<bool> {
        let state = self.begin()?;
        let path = EntryPath::Dn(entry_dn.to_string());
        Ok(state
            .read(self.endpoint.global_catalog, &path, &[])
            .is_ok_and(|e| e.is_some()))
    }

    fn add(&self, entry_dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> NativeResult<()> {
        self.begin_write()?.add(entry_dn, attributes).map(|_| ())
    }

    fn modify(&self, entry_dn: &str, modifications: Vec<Modification>) -> NativeResult<()> {
        self.begin_write()?.modify(entry_dn, modifications)
    }

    fn delete(&self, entry_dn: &str) -> NativeResult<()> {
        self.begin_write()?.delete(entry_dn, false)
    }

    fn delete_tree(&self, entry_dn: &str) -> NativeResult<()> {
        self.begin_write()?.delete(entry_dn, true)
    }

    fn rename(&self, entry_dn: &str, new_dn: &str) -> NativeResult<()> {
        self.begin_write()?.rename(entry_dn, new_dn)
    }

    fn root_dse(&self) -> NativeResult<RootDse> {
        let state = self.begin()?;
        let host = if self.endpoint.server.eq_ignore_ascii_case(&state.domain) {
            let role = if self.endpoint.global_catalog { "gc1" } else { "dc1" };
            format!("{role}.{}", state.domain)
        } else {
            self.endpoint.server.to_ascii_lowercase()
        };
        let offset = if self.endpoint.global_catalog {
            state.replica.usn_offset
        } else {
            0
        };
        Ok(RootDse {
            default_naming_context: state.root.clone(),
            schema_naming_context: state.schema_naming_context(),
            dns_host_name: host,
            highest_committed_usn: state.usn + offset,
        })
    }

    fn schema_class_exists(&self, class_name: &str) -> NativeResult<bool> {
        Ok(self
            .begin()?
            .schema_classes
            .contains(&class_name.to_ascii_lowercase()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryResultSet {
    state: Arc<Mutex<State>>,
    entries: VecDeque<RawEntry>,
    estimate: Option<i64>,
    closed: bool,
}

impl ResultSet for MemoryResultSet {
    fn next_entry(&mut self) -> Option<NativeResult<RawEntry>> {
        if self.closed {
            return None;
        }
        self.entries.pop_front().map(Ok)
    }

    fn estimated_total(&self) -> Option<i64> {
        self.estimate
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.entries.clear();
            let mut state = self.state.lock();
            state.open_result_sets = state.open_result_sets.saturating_sub(1);
        }
    }
}

impl Drop for MemoryResultSet {
    fn drop(&mut self) {
        self.close();
    }
}
