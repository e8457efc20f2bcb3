//! Directory access capability
//!
//! The engine reaches the directory only through the [`Directory`],
//! [`Connection`] and [`ResultSet`] traits. [`ldap::LdapDirectory`] talks to
//! Active Directory over LDAP; `memory::MemoryDirectory` (test builds and the
//! `testing` feature) is an in-process directory with the same observable
//! behavior.

pub mod controls;
pub mod ldap;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use dirsync_connector::error::ConnectorError;
use dirsync_connector::options::{SearchScope, SortKey};
use thiserror::Error;

pub use ldap::LdapDirectory;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryDirectory;

/// Well-known LDAP ports for a domain controller and a global catalog.
pub const LDAP_PORT: u16 = 389;
pub const LDAPS_PORT: u16 = 636;
pub const GC_PORT: u16 = 3268;
pub const GC_SSL_PORT: u16 = 3269;

/// A server to talk to, either as a domain controller or as a global catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub server: String,
    pub global_catalog: bool,
}

impl Endpoint {
    pub fn domain_controller(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            global_catalog: false,
        }
    }

    pub fn global_catalog(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            global_catalog: true,
        }
    }

    /// Same server and role, ignoring case of the host name.
    pub fn same_as(&self, other: &Endpoint) -> bool {
        self.global_catalog == other.global_catalog
            && self.server.eq_ignore_ascii_case(&other.server)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = if self.global_catalog { "GC" } else { "LDAP" };
        write!(f, "{}://{}", role, self.server)
    }
}

/// Bind credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .finish()
    }
}

/// Address of a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPath {
    /// By distinguished name.
    Dn(String),
    /// By the immutable 16-byte `objectGUID`.
    Guid(Vec<u8>),
}

impl std::fmt::Display for EntryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPath::Dn(dn) => f.write_str(dn),
            EntryPath::Guid(bytes) => write!(f, "<GUID={}>", hex::encode(bytes)),
        }
    }
}

/// One entry as returned by the directory: a DN plus raw attribute values.
///
/// Attribute names are stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl RawEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Append values to an attribute.
    pub fn push(&mut self, name: &str, values: impl IntoIterator<Item = Vec<u8>>) {
        self.attributes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .extend(values);
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.push(name, [value.into()]);
        self
    }

    pub fn values(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .filter(|v| !v.is_empty())
    }

    pub fn first(&self, name: &str) -> Option<&[u8]> {
        self.values(name).and_then(|v| v.first()).map(Vec::as_slice)
    }

    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.first(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn first_i64(&self, name: &str) -> Option<i64> {
        self.first_str(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn has(&self, name: &str) -> bool {
        self.values(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<Vec<u8>>> {
        self.attributes.remove(&name.to_ascii_lowercase())
    }

    /// Whether the entry is a tombstone (`isDeleted: TRUE`).
    pub fn is_deleted(&self) -> bool {
        self.first_str("isDeleted")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Attribute names (lowercased) in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

/// How a query pages through its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// Fetch everything, transparently in chunks of `size`.
    Chunked { size: u32 },
    /// Virtual list view window starting at the 1-based `offset`.
    Vlv { before: u32, after: u32, offset: u32 },
}

/// A query in the directory's native terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeQuery {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    /// Attributes to return; empty means all user attributes.
    pub attributes: Vec<String>,
    pub sort: Option<SortKey>,
    pub paging: Paging,
    /// Include tombstones (show-deleted control).
    pub show_deleted: bool,
}

/// One change of a modify request. An empty value list on `Delete` removes
/// the whole attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Add(String, Vec<Vec<u8>>),
    Delete(String, Vec<Vec<u8>>),
    Replace(String, Vec<Vec<u8>>),
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add(name, _)
            | Modification::Delete(name, _)
            | Modification::Replace(name, _) => name,
        }
    }
}

/// Server facts read from the root DSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDse {
    pub default_naming_context: String,
    pub schema_naming_context: String,
    pub dns_host_name: String,
    pub highest_committed_usn: i64,
}

/// Classification of a native failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    NoSuchObject,
    InsufficientAccess,
    InvalidCredentials,
    AlreadyExists,
    NotAllowedOnNonLeaf,
    Unavailable,
    Other,
}

impl NativeErrorKind {
    /// Classify an LDAP result code.
    pub fn from_result_code(rc: u32) -> Self {
        match rc {
            32 => NativeErrorKind::NoSuchObject,
            49 => NativeErrorKind::InvalidCredentials,
            50 => NativeErrorKind::InsufficientAccess,
            51..=53 | 81 | 91 => NativeErrorKind::Unavailable,
            66 => NativeErrorKind::NotAllowedOnNonLeaf,
            68 => NativeErrorKind::AlreadyExists,
            _ => NativeErrorKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NativeErrorKind::NoSuchObject => "no such object",
            NativeErrorKind::InsufficientAccess => "insufficient access rights",
            NativeErrorKind::InvalidCredentials => "invalid credentials",
            NativeErrorKind::AlreadyExists => "entry already exists",
            NativeErrorKind::NotAllowedOnNonLeaf => "not allowed on non-leaf",
            NativeErrorKind::Unavailable => "server unavailable",
            NativeErrorKind::Other => "directory error",
        }
    }
}

impl std::fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the directory layer.
#[derive(Debug, Error)]
#[error("{kind} (code {code}): {message}")]
pub struct NativeError {
    pub kind: NativeErrorKind,
    /// LDAP result code, or 0 when the failure happened below the protocol.
    pub code: u32,
    pub message: String,
}

impl NativeError {
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        let code = match kind {
            NativeErrorKind::NoSuchObject => 32,
            NativeErrorKind::InvalidCredentials => 49,
            NativeErrorKind::InsufficientAccess => 50,
            NativeErrorKind::Unavailable => 52,
            NativeErrorKind::NotAllowedOnNonLeaf => 66,
            NativeErrorKind::AlreadyExists => 68,
            NativeErrorKind::Other => 80,
        };
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Build from an LDAP result code and diagnostic text.
    pub fn from_result(rc: u32, text: impl Into<String>) -> Self {
        Self {
            kind: NativeErrorKind::from_result_code(rc),
            code: rc,
            message: text.into(),
        }
    }

    pub fn no_such_object(target: impl std::fmt::Display) -> Self {
        Self::new(NativeErrorKind::NoSuchObject, format!("{target} does not exist"))
    }

    pub fn is_no_such_object(&self) -> bool {
        self.kind == NativeErrorKind::NoSuchObject
    }

    /// Map into the connector taxonomy, naming the operation and its target.
    pub fn into_connector_error(self, operation: &str, target: &str) -> ConnectorError {
        match self.kind {
            NativeErrorKind::InsufficientAccess => {
                ConnectorError::permission_denied(operation, target, self)
            }
            NativeErrorKind::NoSuchObject => ConnectorError::not_found(target),
            _ => ConnectorError::operation_failed_with_source(operation, target, self),
        }
    }
}

pub type NativeResult<T> = Result<T, NativeError>;

/// Entry point to a directory service.
pub trait Directory: Send + Sync {
    /// Open and bind a connection to `endpoint`.
    fn open(&self, endpoint: &Endpoint, credentials: &Credentials)
        -> NativeResult<Arc<dyn Connection>>;

    /// Locate a domain controller for `domain`.
    fn find_domain_controller(&self, domain: &str, credentials: &Credentials)
        -> NativeResult<String>;

    /// Locate a global catalog server for the forest containing `domain`.
    fn find_global_catalog(&self, domain: &str, credentials: &Credentials) -> NativeResult<String>;
}

/// A bound connection. Every method is safe to call from several threads.
pub trait Connection: Send + Sync {
    /// The endpoint this connection is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Start a query. The returned result set is independent of the borrow of
    /// `self` and must be closed (or dropped) by the caller.
    fn search(&self, query: &NativeQuery) -> NativeResult<Box<dyn ResultSet>>;

    /// Read one entry; `Ok(None)` when it does not exist.
    fn read(&self, path: &EntryPath, attributes: &[String]) -> NativeResult<Option<RawEntry>>;

    fn exists(&self, dn: &str) -> NativeResult<bool>;

    fn add(&self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> NativeResult<()>;

    fn modify(&self, dn: &str, modifications: Vec<Modification>) -> NativeResult<()>;

    /// Delete a leaf entry.
    fn delete(&self, dn: &str) -> NativeResult<()>;

    /// Delete an entry together with its whole subtree.
    fn delete_tree(&self, dn: &str) -> NativeResult<()>;

    /// Rename or move an entry to `new_dn`.
    fn rename(&self, dn: &str, new_dn: &str) -> NativeResult<()>;

    fn root_dse(&self) -> NativeResult<RootDse>;

    /// Whether `class_name` is a class in the directory schema.
    fn schema_class_exists(&self, class_name: &str) -> NativeResult<bool>;

    /// Unbind. Further calls fail.
    fn close(&self);
}

/// Lazily produced results of one query.
pub trait ResultSet: Send {
    /// Next entry in directory order, `None` when exhausted.
    fn next_entry(&mut self) -> Option<NativeResult<RawEntry>>;

    /// Content count estimate reported for a virtual list view, once known.
    fn estimated_total(&self) -> Option<i64>;

    /// Release server-side state. Idempotent.
    fn close(&mut self);
}

/// A connection opened on first use and closed on [`release`](Self::release)
/// or drop.
pub struct LazyConnection<'a> {
    directory: &'a dyn Directory,
    endpoint: Endpoint,
    credentials: Credentials,
    connection: Option<Arc<dyn Connection>>,
}

impl<'a> LazyConnection<'a> {
    pub fn new(directory: &'a dyn Directory, endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            directory,
            endpoint,
            credentials,
            connection: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The connection, opening it if needed.
    pub fn get(&mut self) -> NativeResult<Arc<dyn Connection>> {
        if let Some(connection) = &self.connection {
            return Ok(Arc::clone(connection));
        }
        let connection = self.directory.open(&self.endpoint, &self.credentials)?;
        self.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the connection if one was opened. Idempotent.
    pub fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for LazyConnection<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
