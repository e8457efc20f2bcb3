//! Active Directory over LDAP, using the blocking `ldap3` client.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dirsync_connector::config::ConnectionSettings;
use dirsync_connector::filter::escape_filter_value;
use dirsync_connector::options::SearchScope;
use ldap3::controls::RawControl;
use ldap3::{LdapConn, LdapConnSettings, LdapError, LdapResult, Mod, Scope, SearchEntry};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::controls;
use super::{
    Connection, Credentials, Directory, Endpoint, EntryPath, Modification, NativeError,
    NativeErrorKind, NativeQuery, NativeResult, Paging, RawEntry, ResultSet, RootDse, GC_PORT,
    GC_SSL_PORT, LDAPS_PORT, LDAP_PORT,
};
use crate::dn;

type SharedConn = Arc<Mutex<Option<LdapConn>>>;

const ROOT_DSE_ATTRIBUTES: [&str; 4] = [
    "defaultNamingContext",
    "schemaNamingContext",
    "dnsHostName",
    "highestCommittedUSN",
];

/// Attribute list asking the server to return no attributes.
const NO_ATTRIBUTES: &str = "1.1";

fn transport(err: LdapError) -> NativeError {
    NativeError::new(NativeErrorKind::Unavailable, err.to_string())
}

fn check(result: LdapResult) -> NativeResult<()> {
    if result.rc == 0 {
        Ok(())
    } else {
        Err(NativeError::from_result(result.rc, result.text))
    }
}

fn native_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Object => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

/// Outcome of a base-scoped search. A missing object, a referral to another
/// naming context and a reply holding only continuation references all mean
/// the object is not here.
fn base_outcome(
    result: LdapResult,
    entries: Vec<RawEntry>,
) -> NativeResult<Option<Vec<RawEntry>>> {
    match result.rc {
        10 | 32 => Ok(None),
        0 if entries.is_empty() => Ok(None),
        0 => Ok(Some(entries)),
        rc => Err(NativeError::from_result(rc, result.text)),
    }
}

fn to_raw_entry(entry: SearchEntry) -> RawEntry {
    let mut raw = RawEntry::new(entry.dn);
    for (name, values) in entry.attrs {
        raw.push(&name, values.into_iter().map(String::into_bytes));
    }
    for (name, values) in entry.bin_attrs {
        raw.push(&name, values);
    }
    raw
}

fn value_set(values: Vec<Vec<u8>>) -> HashSet<Vec<u8>> {
    values.into_iter().collect()
}

/// Production [`Directory`] backed by LDAP.
#[derive(Debug, Clone)]
pub struct LdapDirectory {
    use_ssl: bool,
    settings: ConnectionSettings,
}

impl LdapDirectory {
    pub fn new(use_ssl: bool, settings: ConnectionSettings) -> Self {
        Self { use_ssl, settings }
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        let (scheme, port) = match (self.use_ssl, endpoint.global_catalog) {
            (false, false) => ("ldap", LDAP_PORT),
            (true, false) => ("ldaps", LDAPS_PORT),
            (false, true) => ("ldap", GC_PORT),
            (true, true) => ("ldaps", GC_SSL_PORT),
        };
        format!("{scheme}://{}:{port}", endpoint.server)
    }

    /// Bind to the domain's own name and ask the server that answered for
    /// its DNS host name.
    fn locate(&self, endpoint: Endpoint, credentials: &Credentials) -> NativeResult<String> {
        let connection = self.open(&endpoint, credentials)?;
        let dse = connection.root_dse();
        connection.close();
        let host = dse?.dns_host_name;
        if host.is_empty() {
            return Err(NativeError::new(
                NativeErrorKind::Unavailable,
                format!("{endpoint} did not report a dnsHostName"),
            ));
        }
        Ok(host)
    }
}

impl Directory for LdapDirectory {
    fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> NativeResult<Arc<dyn Connection>> {
        let url = self.url(endpoint);
        debug!(url = %url, "Connecting to directory server");

        let settings = LdapConnSettings::new().set_conn_timeout(self.settings.connect_timeout());
        let mut conn = LdapConn::with_settings(settings, &url).map_err(transport)?;

        debug!(bind_dn = %credentials.username, "Performing LDAP bind");
        let result = conn
            .simple_bind(&credentials.username, &credentials.password)
            .map_err(transport)?;
        check(result)?;

        info!(endpoint = %endpoint, "Directory connection established");
        Ok(Arc::new(LdapConnection {
            endpoint: endpoint.clone(),
            conn: Arc::new(Mutex::new(Some(conn))),
            timeout: self.settings.operation_timeout(),
        }))
    }

    fn find_domain_controller(
        &self,
        domain: &str,
        credentials: &Credentials,
    ) -> NativeResult<String> {
        self.locate(Endpoint::domain_controller(domain), credentials)
    }

    fn find_global_catalog(&self, domain: &str, credentials: &Credentials) -> NativeResult<String> {
        self.locate(Endpoint::global_catalog(domain), credentials)
    }
}

/// One bound LDAP session.
pub struct LdapConnection {
    endpoint: Endpoint,
    conn: SharedConn,
    timeout: Duration,
}

impl LdapConnection {
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut LdapConn) -> Result<T, LdapError>,
    ) -> NativeResult<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(|| {
            NativeError::new(NativeErrorKind::Unavailable, "connection is closed")
        })?;
        conn.with_timeout(self.timeout);
        op(conn).map_err(transport)
    }

    fn search_base(
        &self,
        base: &str,
        filter: &str,
        attributes: Vec<String>,
        controls: Vec<RawControl>,
    ) -> NativeResult<Option<Vec<RawEntry>>> {
        let ldap3::SearchResult(entries, result) = self.with_conn(|conn| {
            conn.with_controls(controls)
                .search(base, Scope::Base, filter, attributes)
        })?;
        let entries = entries
            .into_iter()
            .filter(|e| !e.is_ref())
            .map(|e| to_raw_entry(SearchEntry::construct(e)))
            .collect();
        base_outcome(result, entries)
    }
}

impl Connection for LdapConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn search(&self, query: &NativeQuery) -> NativeResult<Box<dyn ResultSet>> {
        debug!(
            base = %query.base,
            filter = %query.filter,
            scope = ?query.scope,
            paging = ?query.paging,
            "Searching directory"
        );
        let mut results = LdapResultSet {
            conn: Arc::clone(&self.conn),
            query: query.clone(),
            timeout: self.timeout,
            buffer: VecDeque::new(),
            cookie: Vec::new(),
            exhausted: false,
            estimate: None,
        };
        results.fetch_page()?;
        Ok(Box::new(results))
    }

    fn read(&self, path: &EntryPath, attributes: &[String]) -> NativeResult<Option<RawEntry>> {
        let attrs = if attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            attributes.to_vec()
        };
        let entries = self.search_base(&path.to_string(), "(objectClass=*)", attrs, Vec::new())?;
        Ok(entries.and_then(|mut e| e.pop()))
    }

    fn exists(&self, dn: &str) -> NativeResult<bool> {
        let entries = self.search_base(
            dn,
            "(objectClass=*)",
            vec![NO_ATTRIBUTES.to_string()],
            Vec::new(),
        )?;
        Ok(entries.is_some_and(|e| !e.is_empty()))
    }

    fn add(&self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> NativeResult<()> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .into_iter()
            .map(|(name, values)| (name.into_bytes(), value_set(values)))
            .collect();
        check(self.with_conn(|conn| conn.add(dn, attrs))?)
    }

    fn modify(&self, dn: &str, modifications: Vec<Modification>) -> NativeResult<()> {
        let mods: Vec<Mod<Vec<u8>>> = modifications
            .into_iter()
            .map(|m| match m {
                Modification::Add(name, values) => Mod::Add(name.into_bytes(), value_set(values)),
                Modification::Delete(name, values) => {
                    Mod::Delete(name.into_bytes(), value_set(values))
                }
                Modification::Replace(name, values) => {
                    Mod::Replace(name.into_bytes(), value_set(values))
                }
            })
            .collect();
        check(self.with_conn(|conn| conn.modify(dn, mods))?)
    }

    fn delete(&self, dn: &str) -> NativeResult<()> {
        check(self.with_conn(|conn| conn.delete(dn))?)
    }

    fn delete_tree(&self, dn: &str) -> NativeResult<()> {
        let tree = controls::flag(controls::TREE_DELETE_OID);
        check(self.with_conn(|conn| conn.with_controls(tree).delete(dn))?)
    }

    fn rename(&self, dn: &str, new_dn: &str) -> NativeResult<()> {
        let (new_rdn, new_parent) = dn::split_rdn(new_dn);
        let old_parent = dn::parent_dn(dn).unwrap_or_default();
        let new_superior =
            (!new_parent.is_empty() && !dn::same_dn(old_parent, new_parent)).then_some(new_parent);
        check(self.with_conn(|conn| conn.modifydn(dn, new_rdn, true, new_superior))?)
    }

    fn root_dse(&self) -> NativeResult<RootDse> {
        let attrs = ROOT_DSE_ATTRIBUTES.iter().map(|a| a.to_string()).collect();
        let entry = self
            .search_base("", "(objectClass=*)", attrs, Vec::new())?
            .and_then(|mut e| e.pop())
            .ok_or_else(|| NativeError::no_such_object("rootDSE"))?;
        Ok(RootDse {
            default_naming_context: entry
                .first_str("defaultNamingContext")
                .unwrap_or_default()
                .to_string(),
            schema_naming_context: entry
                .first_str("schemaNamingContext")
                .unwrap_or_default()
                .to_string(),
            dns_host_name: entry.first_str("dnsHostName").unwrap_or_default().to_string(),
            highest_committed_usn: entry.first_i64("highestCommittedUSN").unwrap_or_default(),
        })
    }

    fn schema_class_exists(&self, class_name: &str) -> NativeResult<bool> {
        let schema = self.root_dse()?.schema_naming_context;
        let value = escape_filter_value(class_name);
        let filter =
            format!("(&(objectClass=classSchema)(|(lDAPDisplayName={value})(cn={value})))");
        let ldap3::SearchResult(entries, result) = self.with_conn(|conn| {
            conn.search(&schema, Scope::OneLevel, &filter, vec![NO_ATTRIBUTES])
        })?;
        check(result)?;
        Ok(!entries.is_empty())
    }

    fn close(&self) {
        if let Some(mut conn) = self.conn.lock().take() {
            if let Err(e) = conn.unbind() {
                warn!(endpoint = %self.endpoint, error = %e, "Unbind failed");
            }
        }
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Results of one query, fetched a page at a time.
struct LdapResultSet {
    conn: SharedConn,
    query: NativeQuery,
    timeout: Duration,
    buffer: VecDeque<RawEntry>,
    cookie: Vec<u8>,
    exhausted: bool,
    estimate: Option<i64>,
}

impl LdapResultSet {
    fn controls(&self) -> NativeResult<Vec<RawControl>> {
        let mut request = Vec::new();
        if let Some(sort) = &self.query.sort {
            request.push(controls::sort_request(&sort.attribute, sort.ascending)?);
        }
        match self.query.paging {
            Paging::Vlv {
                before,
                after,
                offset,
            } => request.push(controls::vlv_request(before, after, offset)?),
            Paging::Chunked { size } => request.push(controls::paged_request(size, &self.cookie)),
        }
        if self.query.show_deleted {
            request.push(controls::flag(controls::SHOW_DELETED_OID));
        }
        Ok(request)
    }

    fn fetch_page(&mut self) -> NativeResult<()> {
        let request = self.controls()?;
        let attributes = if self.query.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            self.query.attributes.clone()
        };

        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(|| {
            NativeError::new(NativeErrorKind::Unavailable, "connection is closed")
        })?;
        let ldap3::SearchResult(entries, result) = conn
            .with_controls(request)
            .with_timeout(self.timeout)
            .search(
                &self.query.base,
                native_scope(self.query.scope),
                &self.query.filter,
                attributes,
            )
            .map_err(transport)?;
        drop(guard);

        if let Some(count) = controls::vlv_content_count(&result.ctrls) {
            self.estimate = Some(count);
        }
        let next_cookie = controls::paged_cookie(&result.ctrls).unwrap_or_default();
        check(result)?;

        self.buffer.extend(
            entries
                .into_iter()
                .filter(|e| !e.is_ref())
                .map(|e| to_raw_entry(SearchEntry::construct(e))),
        );
        self.exhausted = matches!(self.query.paging, Paging::Vlv { .. }) || next_cookie.is_empty();
        self.cookie = next_cookie;
        Ok(())
    }
}

impl ResultSet for LdapResultSet {
    fn next_entry(&mut self) -> Option<NativeResult<RawEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }

    fn estimated_total(&self) -> Option<i64> {
        self.estimate
    }

    fn close(&mut self) {
        self.buffer.clear();
        if self.exhausted || self.cookie.is_empty() {
            self.exhausted = true;
            return;
        }
        self.exhausted = true;
        // A zero-size request with the outstanding cookie abandons the server-side search.
        let abandon = controls::paged_request(0, &self.cookie);
        self.cookie.clear();
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.as_mut() {
            let outcome = conn.with_controls(abandon).search(
                &self.query.base,
                native_scope(self.query.scope),
                &self.query.filter,
                vec![NO_ATTRIBUTES],
            );
            if let Err(e) = outcome {
                debug!(error = %e, "Abandoning paged search failed");
            }
        }
    }
}

impl Drop for LdapResultSet {
    fn drop(&mut self) {
        self.close();
    }
}
