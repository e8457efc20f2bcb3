//! Common test utilities for dirsync-connector-ad integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use dirsync_connector::prelude::*;
use dirsync_connector_ad::directory::RawEntry;
use dirsync_connector_ad::{AdConfig, AdConnector, Directory, MemoryDirectory};

pub const DOMAIN: &str = "corp.example";
pub const ROOT: &str = "DC=corp,DC=example";
pub const ADMIN: &str = "admin";
pub const ADMIN_PASSWORD: &str = "pw";

static TRACING: Once = Once::new();

/// Route connector logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn users() -> String {
    format!("CN=Users,{ROOT}")
}

pub fn user_dn(cn: &str) -> String {
    format!("CN={cn},{}", users())
}

/// An empty domain the admin can bind to.
pub fn memory_directory() -> Arc<MemoryDirectory> {
    init_tracing();
    let directory = MemoryDirectory::new(DOMAIN);
    directory.add_credentials(ADMIN, ADMIN_PASSWORD);
    Arc::new(directory)
}

/// Configuration searching `CN=Users` over SSL.
pub fn test_config() -> AdConfig {
    AdConfig::new(DOMAIN, users())
        .with_admin(ADMIN, ADMIN_PASSWORD)
        .with_ssl()
}

pub fn connect(directory: &Arc<MemoryDirectory>, config: AdConfig) -> AdConnector {
    AdConnector::with_directory(config, Arc::clone(directory) as Arc<dyn Directory>)
        .expect("connector should initialize")
}

/// A fresh domain and a connector over it.
pub fn setup() -> (Arc<MemoryDirectory>, AdConnector) {
    let directory = memory_directory();
    let connector = connect(&directory, test_config());
    (directory, connector)
}

/// Account entry named `cn` under `CN=Users`.
pub fn account_entry(cn: &str) -> RawEntry {
    RawEntry::new(user_dn(cn))
        .with("objectClass", "user")
        .with("sAMAccountName", cn)
        .with("userAccountControl", "512")
}

/// Insert `count` accounts named `user00`, `user01`, ...
pub fn seed_accounts(directory: &MemoryDirectory, count: usize) {
    for i in 0..count {
        directory
            .insert(account_entry(&format!("user{i:02}")))
            .expect("seed account");
    }
}

/// Run a search and collect everything it delivers.
pub fn search_all(
    connector: &AdConnector,
    object_class: &ObjectClass,
    filter: Option<&Filter>,
    options: &OperationOptions,
) -> ConnectorResult<(Vec<ConnectorObject>, SearchSummary)> {
    let mut objects = Vec::new();
    let summary = connector.search(
        object_class,
        filter,
        &mut |object| {
            objects.push(object);
            true
        },
        options,
    )?;
    Ok((objects, summary))
}

/// Run a sync and collect every delta.
pub fn sync_all(
    connector: &AdConnector,
    token: Option<&SyncToken>,
) -> ConnectorResult<(Vec<SyncDelta>, SyncSummary)> {
    let mut deltas = Vec::new();
    let summary = connector.sync(
        &ObjectClass::Account,
        token,
        &mut |delta| {
            deltas.push(delta);
            true
        },
        &OperationOptions::new(),
    )?;
    Ok((deltas, summary))
}

/// Attributes for a new, enabled account.
pub fn new_account(cn: &str) -> AttributeSet {
    AttributeSet::new()
        .with(NAME_ATTRIBUTE, user_dn(cn))
        .with("sAMAccountName", cn)
        .with("givenName", "Test")
        .with("sn", "User")
}
