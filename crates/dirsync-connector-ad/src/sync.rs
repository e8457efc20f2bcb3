//! USN-based incremental sync.
//!
//! Changes are found by `uSNChanged`, in two passes: live entries changed
//! since the modified cursor, then tombstones changed since the deleted
//! cursor. Each delta carries a token with only its own cursor advanced, so a
//! caller that persists the token of the last applied delta never skips a
//! change when it resumes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::object::{
    ConnectorObject, ObjectClass, SyncDelta, SyncDeltaType, SyncSummary, SyncToken,
};
use dirsync_connector::options::SortKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::{Credentials, Directory, Endpoint, RootDse};
use crate::query;
use crate::resolver::usn_of;
use crate::schema::{Schema, IS_DELETED, USN_CHANGED};
use crate::search::{SearchRequest, Searcher};

/// Decoded form of a sync token.
///
/// A cursor of `None` is unbounded: the next pass starts from the first
/// change the server has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub server: String,
    #[serde(rename = "gc")]
    pub global_catalog: bool,
    pub modified: Option<i64>,
    pub deleted: Option<i64>,
}

impl SyncWatermark {
    /// Both cursors unbounded.
    pub fn new(server: impl Into<String>, global_catalog: bool) -> Self {
        Self {
            server: server.into(),
            global_catalog,
            modified: None,
            deleted: None,
        }
    }

    pub fn encode(&self) -> ConnectorResult<SyncToken> {
        let body = serde_json::to_vec(self).map_err(|e| {
            ConnectorError::operation_failed("sync", &self.server, format!("cannot encode token: {e}"))
        })?;
        Ok(SyncToken::new(URL_SAFE_NO_PAD.encode(body)))
    }

    /// `None` for an empty token.
    pub fn decode(token: &SyncToken) -> ConnectorResult<Option<Self>> {
        let text = token.as_str().trim();
        if text.is_empty() {
            return Ok(None);
        }
        let malformed = |detail: String| ConnectorError::usage(format!("malformed sync token: {detail}"));
        let body = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| malformed(e.to_string()))?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| malformed(e.to_string()))
    }

    fn same_server(&self, other: &SyncWatermark) -> bool {
        self.global_catalog == other.global_catalog && self.server.eq_ignore_ascii_case(&other.server)
    }

    /// Filter fragment for live entries changed past the modified cursor.
    pub fn modified_filter(&self) -> Option<String> {
        self.modified
            .map(|usn| format!("(!({USN_CHANGED}<={usn}))"))
    }

    /// Filter fragment for tombstones changed past the deleted cursor.
    pub fn deleted_filter(&self) -> String {
        match self.deleted {
            Some(usn) => format!("(&(!({USN_CHANGED}<={usn}))({IS_DELETED}=TRUE))"),
            None => format!("({IS_DELETED}=TRUE)"),
        }
    }
}

/// Where and what to sync.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub endpoint: Endpoint,
    /// Root of the modified pass.
    pub container: String,
    pub object_class: ObjectClass,
    pub attributes: Vec<String>,
}

/// Runs the two sync passes through a [`Searcher`].
pub struct SyncEngine<'a> {
    directory: &'a dyn Directory,
    credentials: &'a Credentials,
    schema: &'a Schema,
    searcher: &'a Searcher<'a>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        directory: &'a dyn Directory,
        credentials: &'a Credentials,
        schema: &'a Schema,
        searcher: &'a Searcher<'a>,
    ) -> Self {
        Self {
            directory,
            credentials,
            schema,
            searcher,
        }
    }

    fn root_dse(&self, endpoint: &Endpoint) -> ConnectorResult<RootDse> {
        let connection = self
            .directory
            .open(endpoint, self.credentials)
            .map_err(|e| e.into_connector_error("sync", &endpoint.server))?;
        let result = connection
            .root_dse()
            .map_err(|e| e.into_connector_error("sync", &endpoint.server));
        connection.close();
        result
    }

    /// Token with both cursors at the server's highest committed USN.
    pub fn latest_token(&self, endpoint: &Endpoint) -> ConnectorResult<SyncToken> {
        let usn = self.root_dse(endpoint)?.highest_committed_usn;
        let mut watermark = SyncWatermark::new(endpoint.server.clone(), endpoint.global_catalog);
        watermark.modified = Some(usn);
        watermark.deleted = Some(usn);
        debug!(server = %endpoint, usn, "Latest sync token");
        watermark.encode()
    }

    /// Deliver deltas since `token` to `handler` until it returns false.
    pub fn sync(
        &self,
        target: &SyncTarget,
        token: Option<&SyncToken>,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
    ) -> ConnectorResult<SyncSummary> {
        let fresh = SyncWatermark::new(target.endpoint.server.clone(), target.endpoint.global_catalog);
        let mut watermark = match token.map(SyncWatermark::decode).transpose()?.flatten() {
            Some(decoded) if decoded.same_server(&fresh) => decoded,
            Some(decoded) => {
                warn!(
                    token_server = %decoded.server,
                    token_gc = decoded.global_catalog,
                    server = %fresh.server,
                    gc = fresh.global_catalog,
                    "Sync token was issued by another server; starting over"
                );
                fresh
            }
            None => fresh,
        };
        info!(
            server = %target.endpoint,
            modified = ?watermark.modified,
            deleted = ?watermark.deleted,
            "Starting sync"
        );

        let class = self.schema.class(&target.object_class);
        let mut attributes = target.attributes.clone();
        if !attributes.iter().any(|a| a.eq_ignore_ascii_case(USN_CHANGED)) {
            attributes.push(USN_CHANGED.to_string());
        }
        let mut summary = SyncSummary::default();

        let modified = SearchRequest::new(
            target.object_class.clone(),
            query::build_filter(&class, watermark.modified_filter().as_deref(), false),
            target.container.clone(),
            target.endpoint.clone(),
        )
        .with_attributes(attributes.clone())
        .with_sort(SortKey::ascending(USN_CHANGED));
        let stopped = self.pass(modified, SyncDeltaType::CreateOrUpdate, &mut watermark, &mut summary, handler)?;
        if stopped {
            return Ok(summary);
        }

        let domain_root = self.root_dse(&target.endpoint)?.default_naming_context;
        let deleted = SearchRequest::new(
            target.object_class.clone(),
            query::build_filter(&class, Some(&watermark.deleted_filter()), true),
            domain_root,
            target.endpoint.clone(),
        )
        .with_attributes(attributes)
        .with_sort(SortKey::ascending(USN_CHANGED))
        .with_deleted(true);
        self.pass(deleted, SyncDeltaType::Delete, &mut watermark, &mut summary, handler)?;

        info!(
            modified = summary.modified,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "Sync finished"
        );
        Ok(summary)
    }

    /// One pass. Returns true when the handler asked to stop.
    fn pass(
        &self,
        request: SearchRequest,
        kind: SyncDeltaType,
        watermark: &mut SyncWatermark,
        summary: &mut SyncSummary,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
    ) -> ConnectorResult<bool> {
        debug!(filter = %request.filter, base = %request.base, kind = ?kind, "Sync pass");
        let mut run = self.searcher.run(request)?;
        let mut stopped = false;
        for object in run.by_ref() {
            let object = object?;
            let usn = usn_of(&object).ok_or_else(|| {
                ConnectorError::operation_failed(
                    "sync",
                    object.name(),
                    format!("attribute {USN_CHANGED} is missing; cannot advance the sync token"),
                )
            })?;
            let cursor = match kind {
                SyncDeltaType::CreateOrUpdate => &mut watermark.modified,
                SyncDeltaType::Delete => &mut watermark.deleted,
            };
            *cursor = Some(cursor.map_or(usn, |current| current.max(usn)));

            let token = watermark.encode()?;
            let delta = SyncDelta {
                token: token.clone(),
                delta_type: kind,
                object: without_deleted_flag(object)?,
            };
            match kind {
                SyncDeltaType::CreateOrUpdate => summary.modified += 1,
                SyncDeltaType::Delete => summary.deleted += 1,
            }
            summary.token = Some(token);
            if !handler(delta) {
                debug!("Sync stopped by handler");
                stopped = true;
                break;
            }
        }
        summary.skipped += run.skipped();
        Ok(stopped)
    }
}

/// The object with `isDeleted` dropped from its attributes.
fn without_deleted_flag(object: ConnectorObject) -> ConnectorResult<ConnectorObject> {
    if object.attributes().get(IS_DELETED).is_none() {
        return Ok(object);
    }
    let attributes = object
        .attributes()
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(IS_DELETED))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    ConnectorObject::new(
        object.object_class().clone(),
        object.uid().clone(),
        object.name(),
        attributes,
        object.is_deleted(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, RawEntry};
    use dirsync_connector::operation::{AttributeSet, Uid};

    const ROOT: &str = "DC=corp,DC=example";

    fn fixture() -> (MemoryDirectory, Credentials, Schema) {
        let directory = MemoryDirectory::new("corp.example");
        directory.add_credentials("admin", "pw");
        (directory, Credentials::new("admin", "pw"), Schema::build("user"))
    }

    fn add_user(directory: &MemoryDirectory, name: &str) {
        directory
            .insert(RawEntry::new(format!("CN={name},CN=Users,{ROOT}")).with("objectClass", "user"))
            .unwrap();
    }

    fn target() -> SyncTarget {
        SyncTarget {
            endpoint: Endpoint::domain_controller("dc1.corp.example"),
            container: format!("CN=Users,{ROOT}"),
            object_class: ObjectClass::Account,
            attributes: vec!["sAMAccountName".to_string()],
        }
    }

    #[test]
    fn test_watermark_token_format() {
        let mut watermark = SyncWatermark::new("dc1.corp.example", false);
        watermark.modified = Some(42);
        let token = watermark.encode().unwrap();
        assert!(!token.as_str().contains('='));

        let body = URL_SAFE_NO_PAD.decode(token.as_str()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"server": "dc1.corp.example", "gc": false, "modified": 42, "deleted": null})
        );
        assert_eq!(SyncWatermark::decode(&token).unwrap(), Some(watermark));
    }

    #[test]
    fn test_empty_and_malformed_tokens() {
        assert_eq!(SyncWatermark::decode(&SyncToken::new("")).unwrap(), None);
        for bad in ["%%%", "bm90IGpzb24"] {
            let err = SyncWatermark::decode(&SyncToken::new(bad)).unwrap_err();
            assert!(err.is_caller_error(), "{bad}");
        }
    }

    #[test]
    fn test_filters_for_cursors() {
        let mut watermark = SyncWatermark::new("dc1", false);
        assert_eq!(watermark.modified_filter(), None);
        assert_eq!(watermark.deleted_filter(), "(isDeleted=TRUE)");
        watermark.modified = Some(10);
        watermark.deleted = Some(20);
        assert_eq!(watermark.modified_filter().unwrap(), "(!(uSNChanged<=10))");
        assert_eq!(
            watermark.deleted_filter(),
            "(&(!(uSNChanged<=20))(isDeleted=TRUE))"
        );
    }

    #[test]
    fn test_strip_deleted_flag() {
        let object = ConnectorObject::new(
            ObjectClass::Account,
            Uid::from_value("<GUID=01>"),
            "CN=x",
            AttributeSet::new().with("isDeleted", false).with("cn", "x"),
            false,
        )
        .unwrap();
        let stripped = without_deleted_flag(object).unwrap();
        assert!(!stripped.attributes().has("isDeleted"));
        assert!(stripped.attributes().has("cn"));
    }

    #[test]
    fn test_first_sync_emits_every_change_in_usn_order() {
        let (directory, creds, schema) = fixture();
        add_user(&directory, "a");
        add_user(&directory, "b");
        let conn = directory
            .open(&Endpoint::domain_controller("dc1.corp.example"), &creds)
            .unwrap();
        conn.delete(&format!("CN=a,CN=Users,{ROOT}")).unwrap();
        conn.close();

        let searcher = Searcher::new(&directory, &schema, &creds, Endpoint::domain_controller("corp.example"));
        let engine = SyncEngine::new(&directory, &creds, &schema, &searcher);
        let mut deltas = Vec::new();
        let summary = engine
            .sync(&target(), None, &mut |delta| {
                deltas.push(delta);
                true
            })
            .unwrap();

        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(deltas[0].delta_type, SyncDeltaType::CreateOrUpdate);
        assert_eq!(deltas[0].object.name(), format!("CN=b,CN=Users,{ROOT}"));
        assert_eq!(deltas[1].delta_type, SyncDeltaType::Delete);
        assert!(deltas[1].object.is_deleted());
        assert_eq!(summary.token.as_ref(), Some(&deltas[1].token));

        let last = SyncWatermark::decode(&deltas[1].token).unwrap().unwrap();
        let first = SyncWatermark::decode(&deltas[0].token).unwrap().unwrap();
        assert_eq!(last.modified, first.modified);
        assert_eq!(first.deleted, None);
        assert_eq!(last.deleted, Some(directory.highest_usn()));
        assert_eq!(directory.open_connections(), 0);
    }

    #[test]
    fn test_resume_skips_applied_changes() {
        let (directory, creds, schema) = fixture();
        add_user(&directory, "a");
        let searcher = Searcher::new(&directory, &schema, &creds, Endpoint::domain_controller("corp.example"));
        let engine = SyncEngine::new(&directory, &creds, &schema, &searcher);

        let first = engine.sync(&target(), None, &mut |_| true).unwrap();
        add_user(&directory, "b");
        let mut names = Vec::new();
        engine
            .sync(&target(), first.token.as_ref(), &mut |delta| {
                names.push(delta.object.name().to_string());
                true
            })
            .unwrap();
        assert_eq!(names, vec![format!("CN=b,CN=Users,{ROOT}")]);
    }

    #[test]
    fn test_token_from_other_server_restarts() {
        let (directory, creds, schema) = fixture();
        add_user(&directory, "a");
        let searcher = Searcher::new(&directory, &schema, &creds, Endpoint::domain_controller("corp.example"));
        let engine = SyncEngine::new(&directory, &creds, &schema, &searcher);

        let mut foreign = SyncWatermark::new("dc9.corp.example", false);
        foreign.modified = Some(i64::MAX - 1);
        let token = foreign.encode().unwrap();
        let summary = engine.sync(&target(), Some(&token), &mut |_| true).unwrap();
        assert_eq!(summary.modified, 1);
    }

    #[test]
    fn test_handler_stop_skips_delete_pass() {
        let (directory, creds, schema) = fixture();
        add_user(&directory, "a");
        add_user(&directory, "b");
        let searcher = Searcher::new(&directory, &schema, &creds, Endpoint::domain_controller("corp.example"));
        let engine = SyncEngine::new(&directory, &creds, &schema, &searcher);

        let before = directory.queries().len();
        let summary = engine.sync(&target(), None, &mut |_| false).unwrap();
        assert_eq!(summary.modified, 1);
        assert_eq!(directory.queries().len(), before + 1);
        assert_eq!(directory.open_connections(), 0);
    }

    #[test]
    fn test_latest_token_uses_highest_committed_usn() {
        let (directory, creds, schema) = fixture();
        add_user(&directory, "a");
        let searcher = Searcher::new(&directory, &schema, &creds, Endpoint::domain_controller("corp.example"));
        let engine = SyncEngine::new(&directory, &creds, &schema, &searcher);

        let token = engine
            .latest_token(&Endpoint::domain_controller("dc1.corp.example"))
            .unwrap();
        let watermark = SyncWatermark::decode(&token).unwrap().unwrap();
        assert_eq!(watermark.modified, Some(directory.highest_usn()));
        assert_eq!(watermark.deleted, Some(directory.highest_usn()));
        assert_eq!(watermark.server, "dc1.corp.example");

        let summary = engine.sync(&target(), Some(&token), &mut |_| true).unwrap();
        assert_eq!(summary.modified + summary.deleted, 0);
        assert!(summary.token.is_none());
    }
}
