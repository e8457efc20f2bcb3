//! # Active Directory Connector
//!
//! Search, USN-based sync and provisioning against Active Directory.
//!
//! ## Features
//!
//! - Virtual-list-view offset paging, internal chunking otherwise
//! - Global catalog searches completed from a domain controller
//! - Incremental sync of changes and deletions through an opaque token
//! - Two-phase create that removes partially created entries
//! - Account enable/disable and password writes
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//! use dirsync_connector_ad::{AdConfig, AdConnector};
//!
//! let config = AdConfig::new("corp.example", "CN=Users,DC=corp,DC=example")
//!     .with_admin("CORP\\svc-sync", "secret")
//!     .with_ssl();
//! let connector = AdConnector::new(config)?;
//! connector.test()?;
//!
//! let mut latest = None;
//! connector.sync(&ObjectClass::Account, None, &mut |delta| {
//!     latest = Some(delta.token.clone());
//!     true
//! }, &OperationOptions::new())?;
//! ```
//!
//! Directory access goes through the [`directory::Directory`] trait.
//! [`directory::LdapDirectory`] talks LDAP. With the `testing` feature,
//! `directory::MemoryDirectory` keeps everything in process for tests.

pub mod account;
pub mod config;
pub mod connector;
pub mod directory;
pub mod dn;
pub mod guid;
pub mod mutation;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod search;
pub mod sync;

// Re-exports
pub use config::AdConfig;
pub use connector::AdConnector;
pub use directory::{Directory, LdapDirectory};

#[cfg(any(test, feature = "testing"))]
pub use directory::MemoryDirectory;
pub use search::{SearchRequest, SearchRun, Searcher};
pub use sync::SyncWatermark;
