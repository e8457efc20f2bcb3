//! Paged search executor.
//!
//! A [`SearchRequest`] is validated and fully resolved before anything
//! touches the network. [`Searcher::run`] then turns it into a [`SearchRun`],
//! a lazy iterator of normalized objects that owns the result set, any
//! connection opened for the call, and the resolver's authoritative
//! connection. Dropping the run releases all three.

use std::sync::Arc;

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::filter::Filter;
use dirsync_connector::object::{ConnectorObject, ObjectClass, SearchSummary};
use dirsync_connector::operation::{NAME_ATTRIBUTE, UID_ATTRIBUTE};
use dirsync_connector::options::{OperationOptions, SearchScope, SortKey};
use tracing::{debug, warn};

use crate::directory::{
    Connection, Credentials, Directory, Endpoint, LazyConnection, NativeQuery, Paging, ResultSet,
};
use crate::dn;
use crate::query;
use crate::resolver::Resolver;
use crate::schema::Schema;

/// Batch size for unpaged searches.
pub const CHUNK_SIZE: u32 = 1000;

/// Sort attribute used when a paged request names none.
pub const DEFAULT_SORT_ATTRIBUTE: &str = "cn";

/// A fully resolved search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub object_class: ObjectClass,
    /// Final directory filter.
    pub filter: String,
    pub base: String,
    pub scope: SearchScope,
    /// Requested attribute names; always includes `__UID__` and `__NAME__`.
    pub attributes: Vec<String>,
    pub sort: Option<SortKey>,
    /// VLV page size; `None` fetches everything in chunks.
    pub page_size: Option<u32>,
    /// 1-based VLV offset.
    pub offset: u32,
    pub include_deleted: bool,
    pub endpoint: Endpoint,
    pub diagnostics: Vec<String>,
}

impl SearchRequest {
    /// Unpaged subtree search with no extra attributes.
    pub fn new(
        object_class: ObjectClass,
        filter: impl Into<String>,
        base: impl Into<String>,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            object_class,
            filter: filter.into(),
            base: base.into(),
            scope: SearchScope::Subtree,
            attributes: with_identity(Vec::new()),
            sort: None,
            page_size: None,
            offset: 1,
            include_deleted: false,
            endpoint,
            diagnostics: Vec::new(),
        }
    }

    /// Build a request from caller input.
    ///
    /// Fails with a usage error for an offset of 0 on a paged request, more
    /// than one sort key, an unknown scope, or a malformed filter.
    pub fn from_options(
        schema: &Schema,
        object_class: &ObjectClass,
        filter: Option<&Filter>,
        options: &OperationOptions,
        default_container: &str,
        endpoint: Endpoint,
    ) -> ConnectorResult<Self> {
        let page_size = options.page_size.filter(|size| *size > 0);
        let offset = match (page_size, options.paged_results_offset) {
            (Some(_), Some(0)) => {
                return Err(ConnectorError::usage(
                    "paged results offset 0 is not supported; offsets start at 1",
                ))
            }
            (_, Some(offset)) => offset,
            (_, None) => 1,
        };
        if options.sort_keys.len() > 1 {
            return Err(ConnectorError::usage("at most one sort key is supported"));
        }
        let scope = match options.scope.as_deref() {
            Some(scope) => SearchScope::parse(scope)?,
            None => SearchScope::Subtree,
        };

        let class = schema.class(object_class);
        let caller = query::caller_filter(filter, options)?;
        let mut diagnostics: Vec<String> = caller.diagnostic.into_iter().collect();
        let filter = query::build_filter(
            &class,
            caller.text.as_deref(),
            options.include_tombstones,
        );

        let attributes = with_identity(
            options
                .attributes_to_get
                .clone()
                .unwrap_or_else(|| class.default_attributes.clone()),
        );

        let mut sort = options.sort_keys.first().cloned();
        if page_size.is_some() && sort.is_none() {
            diagnostics.push(format!(
                "paged search without a sort key; sorting by {DEFAULT_SORT_ATTRIBUTE} ascending"
            ));
            sort = Some(SortKey::ascending(DEFAULT_SORT_ATTRIBUTE));
        }
        if let Some(cookie) = &options.paged_results_cookie {
            warn!(cookie = %cookie, "Paged results cookie is not supported and will be ignored");
            diagnostics.push("paged results cookie is not supported and was ignored".to_string());
        }

        Ok(Self {
            object_class: object_class.clone(),
            filter,
            base: options
                .container
                .clone()
                .unwrap_or_else(|| default_container.to_string()),
            scope,
            attributes,
            sort,
            page_size,
            offset,
            include_deleted: options.include_tombstones,
            endpoint,
            diagnostics,
        })
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = with_identity(attributes);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: SortKey) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub fn with_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    fn paging(&self) -> Paging {
        match self.page_size {
            Some(size) => Paging::Vlv {
                before: 0,
                after: size.saturating_sub(1),
                offset: self.offset,
            },
            None => Paging::Chunked { size: CHUNK_SIZE },
        }
    }
}

fn with_identity(mut attributes: Vec<String>) -> Vec<String> {
    for name in [UID_ATTRIBUTE, NAME_ATTRIBUTE] {
        if !attributes.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            attributes.push(name.to_string());
        }
    }
    attributes
}

/// Runs search requests against the directory.
pub struct Searcher<'a> {
    directory: &'a dyn Directory,
    schema: &'a Schema,
    credentials: &'a Credentials,
    authority: Endpoint,
    persistent: Option<(Arc<dyn Connection>, String)>,
}

impl<'a> Searcher<'a> {
    /// `authority` is the domain controller replica results are re-read from.
    pub fn new(
        directory: &'a dyn Directory,
        schema: &'a Schema,
        credentials: &'a Credentials,
        authority: Endpoint,
    ) -> Self {
        Self {
            directory,
            schema,
            credentials,
            authority,
            persistent: None,
        }
    }

    /// Reuse `connection` for searches rooted at `container` on its endpoint.
    #[must_use]
    pub fn with_persistent(mut self, connection: Arc<dyn Connection>, container: impl Into<String>) -> Self {
        self.persistent = Some((connection, container.into()));
        self
    }

    fn reusable(&self, request: &SearchRequest) -> Option<Arc<dyn Connection>> {
        let (connection, container) = self.persistent.as_ref()?;
        (connection.endpoint().same_as(&request.endpoint) && dn::same_dn(container, &request.base))
            .then(|| Arc::clone(connection))
    }

    /// Start a search. Nothing is fetched beyond the first page or chunk
    /// until the run is iterated.
    pub fn run(&self, request: SearchRequest) -> ConnectorResult<SearchRun<'a>> {
        let (connection, owns_connection) = match self.reusable(&request) {
            Some(connection) => (connection, false),
            None => {
                debug!(endpoint = %request.endpoint, base = %request.base, "Opening search connection");
                let connection = self
                    .directory
                    .open(&request.endpoint, self.credentials)
                    .map_err(|e| e.into_connector_error("search", &request.base))?;
                (connection, true)
            }
        };

        let mut resolver = Resolver::new(
            self.schema,
            request.object_class.clone(),
            request.attributes.clone(),
        );
        if request.endpoint.global_catalog {
            resolver = resolver.with_authority(LazyConnection::new(
                self.directory,
                self.authority.clone(),
                self.credentials.clone(),
            ));
        }

        let paging = request.paging();
        let query = NativeQuery {
            base: request.base.clone(),
            scope: request.scope,
            filter: request.filter.clone(),
            attributes: resolver.native_attributes().to_vec(),
            sort: request.sort.clone(),
            paging,
            show_deleted: request.include_deleted,
        };
        let mut run = SearchRun {
            connection,
            owns_connection,
            results: None,
            resolver,
            base: request.base,
            paging,
            delivered: 0,
            skipped: 0,
            diagnostics: request.diagnostics,
        };

        debug!(
            base = %query.base,
            filter = %query.filter,
            scope = ?query.scope,
            paging = ?query.paging,
            "Executing directory search"
        );
        // On failure the run is dropped here, which releases the connection.
        let results = run
            .connection
            .search(&query)
            .map_err(|e| e.into_connector_error("search", &query.base))?;
        run.results = Some(results);
        Ok(run)
    }

    /// Deliver every object of `request` to `handler` until it returns false.
    pub fn execute(
        &self,
        request: SearchRequest,
        handler: &mut dyn FnMut(ConnectorObject) -> bool,
    ) -> ConnectorResult<SearchSummary> {
        let mut run = self.run(request)?;
        for object in run.by_ref() {
            if !handler(object?) {
                debug!("Search stopped by handler");
                break;
            }
        }
        let summary = run.summary();
        debug!(
            delivered = run.delivered(),
            skipped = run.skipped(),
            remaining = ?summary.remaining_paged_results,
            "Search finished"
        );
        Ok(summary)
    }
}

/// One executing search.
pub struct SearchRun<'a> {
    connection: Arc<dyn Connection>,
    owns_connection: bool,
    results: Option<Box<dyn ResultSet>>,
    resolver: Resolver<'a>,
    base: String,
    paging: Paging,
    delivered: u64,
    skipped: u64,
    diagnostics: Vec<String>,
}

impl SearchRun<'_> {
    /// Objects yielded so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Entries that could not be resolved and were skipped.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Advisory remaining count and diagnostics. The remaining count is only
    /// known for paged searches whose result set is still open.
    pub fn summary(&self) -> SearchSummary {
        let remaining = match (self.paging, &self.results) {
            (Paging::Vlv { offset, .. }, Some(results)) => results.estimated_total().map(|total| {
                total - (i64::from(offset) - 1) - i64::try_from(self.delivered).unwrap_or(i64::MAX)
            }),
            _ => None,
        };
        SearchSummary {
            remaining_paged_results: remaining,
            diagnostics: self.diagnostics.clone(),
            skipped: self.skipped,
        }
    }

    /// Release the result set and every connection the run owns. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut results) = self.results.take() {
            results.close();
        }
        self.resolver.release();
        if self.owns_connection {
            self.owns_connection = false;
            self.connection.close();
        }
    }
}

impl Iterator for SearchRun<'_> {
    type Item = ConnectorResult<ConnectorObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.results.as_mut()?.next_entry()? {
                Ok(raw) => raw,
                Err(e) => {
                    let err = e.into_connector_error("search", &self.base);
                    self.release();
                    return Some(Err(err));
                }
            };
            match self.resolver.resolve(&raw) {
                Ok(object) => {
                    self.delivered += 1;
                    return Some(Ok(object));
                }
                Err(e) => {
                    warn!(dn = %raw.dn, error = %e, "Skipping entry that could not be resolved");
                    self.skipped += 1;
                }
            }
        }
    }
}

impl Drop for SearchRun<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, RawEntry};
    use dirsync_connector::operation::AttributeValue;

    const ROOT: &str = "DC=corp,DC=example";

    fn users() -> String {
        format!("CN=Users,{ROOT}")
    }

    fn dc() -> Endpoint {
        Endpoint::domain_controller("corp.example")
    }

    fn seeded(count: usize) -> MemoryDirectory {
        let directory = MemoryDirectory::new("corp.example");
        directory.add_credentials("admin", "pw");
        for i in 0..count {
            directory
                .insert(
                    RawEntry::new(format!("CN=user{i:02},{}", users()))
                        .with("objectClass", "user")
                        .with("sAMAccountName", format!("user{i:02}").as_str()),
                )
                .unwrap();
        }
        directory
    }

    fn request(schema: &Schema, options: &OperationOptions) -> ConnectorResult<SearchRequest> {
        SearchRequest::from_options(schema, &ObjectClass::Account, None, options, &users(), dc())
    }

    #[test]
    fn test_offset_zero_is_rejected() {
        let schema = Schema::build("user");
        let options = OperationOptions::new()
            .with_page_size(10)
            .with_paged_results_offset(0);
        assert!(request(&schema, &options).unwrap_err().is_caller_error());
    }

    #[test]
    fn test_multiple_sort_keys_rejected() {
        let schema = Schema::build("user");
        let options = OperationOptions::new()
            .with_sort_key(SortKey::ascending("cn"))
            .with_sort_key(SortKey::descending("sn"));
        assert!(request(&schema, &options).unwrap_err().is_caller_error());
    }

    #[test]
    fn test_paged_request_gets_a_sort_key() {
        let schema = Schema::build("user");
        let req = request(&schema, &OperationOptions::new().with_page_size(10)).unwrap();
        assert_eq!(req.sort, Some(SortKey::ascending("cn")));
        assert_eq!(req.offset, 1);
        assert_eq!(
            req.paging(),
            Paging::Vlv {
                before: 0,
                after: 9,
                offset: 1
            }
        );
        assert_eq!(req.diagnostics.len(), 1);
    }

    #[test]
    fn test_unpaged_request_defaults() {
        let schema = Schema::build("user");
        let req = request(&schema, &OperationOptions::new()).unwrap();
        assert_eq!(req.sort, None);
        assert_eq!(req.paging(), Paging::Chunked { size: CHUNK_SIZE });
        assert_eq!(req.base, users());
        assert_eq!(req.scope, SearchScope::Subtree);
        assert!(req.attributes.iter().any(|a| a == UID_ATTRIBUTE));
        assert!(req.attributes.iter().any(|a| a == NAME_ATTRIBUTE));
        assert!(req.attributes.iter().any(|a| a == "sAMAccountName"));
        assert_eq!(req.filter, "(&(ObjectCategory=Person)(objectclass=user))");
    }

    #[test]
    fn test_cookie_is_ignored_with_diagnostic() {
        let schema = Schema::build("user");
        let options = OperationOptions::new()
            .with_page_size(5)
            .with_sort_key(SortKey::ascending("sn"))
            .with_paged_results_cookie("abc");
        let req = request(&schema, &options).unwrap();
        assert_eq!(req.sort, Some(SortKey::ascending("sn")));
        assert_eq!(req.diagnostics.len(), 1);
        assert!(req.diagnostics[0].contains("cookie"));
    }

    #[test]
    fn test_container_and_scope_options() {
        let schema = Schema::build("user");
        let options = OperationOptions::new()
            .with_container(format!("OU=Sales,{ROOT}"))
            .with_scope("onelevel");
        let req = request(&schema, &options).unwrap();
        assert_eq!(req.base, format!("OU=Sales,{ROOT}"));
        assert_eq!(req.scope, SearchScope::OneLevel);

        let bad = request(&schema, &OperationOptions::new().with_scope("deep"));
        assert!(bad.unwrap_err().is_caller_error());
    }

    #[test]
    fn test_paged_run_reports_remaining() {
        let directory = seeded(25);
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let searcher = Searcher::new(&directory, &schema, &creds, dc());
        let req = request(&schema, &OperationOptions::new().with_page_size(10)).unwrap();

        let mut names = Vec::new();
        let summary = searcher
            .execute(req, &mut |object| {
                names.push(object.name().to_string());
                true
            })
            .unwrap();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], format!("CN=user00,{}", users()));
        assert_eq!(summary.remaining_paged_results, Some(15));
        assert_eq!(directory.open_connections(), 0);
        assert_eq!(directory.open_result_sets(), 0);
    }

    #[test]
    fn test_persistent_connection_is_reused_only_for_default_root() {
        let directory = seeded(3);
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let persistent = directory.open(&dc(), &creds).unwrap();
        let searcher = Searcher::new(&directory, &schema, &creds, dc())
            .with_persistent(Arc::clone(&persistent), users().to_lowercase());

        let req = request(&schema, &OperationOptions::new()).unwrap();
        searcher.execute(req, &mut |_| true).unwrap();
        assert_eq!(directory.connections_opened(), 1);
        assert_eq!(directory.open_connections(), 1);

        let req = request(&schema, &OperationOptions::new().with_container(ROOT)).unwrap();
        searcher.execute(req, &mut |_| true).unwrap();
        assert_eq!(directory.connections_opened(), 2);
        assert_eq!(directory.open_connections(), 1);
    }

    #[test]
    fn test_early_stop_releases_resources() {
        let directory = seeded(5);
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let searcher = Searcher::new(&directory, &schema, &creds, dc());

        let mut seen = 0;
        searcher
            .execute(request(&schema, &OperationOptions::new()).unwrap(), &mut |_| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(directory.open_connections(), 0);
        assert_eq!(directory.open_result_sets(), 0);
    }

    #[test]
    fn test_lazy_run_releases_on_drop() {
        let directory = seeded(5);
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let searcher = Searcher::new(&directory, &schema, &creds, dc());

        let mut run = searcher
            .run(request(&schema, &OperationOptions::new()).unwrap())
            .unwrap();
        assert!(run.next().unwrap().is_ok());
        assert_eq!(directory.open_result_sets(), 1);
        drop(run);
        assert_eq!(directory.open_connections(), 0);
        assert_eq!(directory.open_result_sets(), 0);
    }

    #[test]
    fn test_bad_base_surfaces_not_found() {
        let directory = seeded(1);
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let searcher = Searcher::new(&directory, &schema, &creds, dc());
        let req = request(
            &schema,
            &OperationOptions::new().with_container(format!("OU=Missing,{ROOT}")),
        )
        .unwrap();

        let err = searcher.execute(req, &mut |_| true).unwrap_err();
        assert_eq!(err.error_code(), "OBJECT_NOT_FOUND");
        assert_eq!(directory.open_connections(), 0);
    }

    #[test]
    fn test_global_catalog_results_are_completed() {
        let directory = seeded(0);
        directory.set_partial_attribute_set(&["sAMAccountName"]);
        directory
            .insert(
                RawEntry::new(format!("CN=jdoe,{}", users()))
                    .with("objectClass", "user")
                    .with("title", "Engineer"),
            )
            .unwrap();
        let schema = Schema::build("user");
        let creds = Credentials::new("admin", "pw");
        let searcher = Searcher::new(&directory, &schema, &creds, dc());
        let req = SearchRequest::new(
            ObjectClass::Account,
            "(objectclass=user)",
            ROOT,
            Endpoint::global_catalog("corp.example"),
        )
        .with_attributes(vec!["title".to_string()]);

        let mut titles = Vec::new();
        searcher
            .execute(req, &mut |object| {
                titles.push(object.attributes().get("title").cloned());
                true
            })
            .unwrap();
        assert_eq!(titles, vec![Some(AttributeValue::String("Engineer".to_string()))]);
        assert_eq!(directory.open_connections(), 0);
    }
}
