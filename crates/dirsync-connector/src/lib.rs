//! # Connector Framework
//!
//! Core abstractions shared by directory connectors: the operation types a
//! caller hands in, the normalized objects and sync deltas a connector hands
//! back, and the error taxonomy both sides agree on.
//!
//! ## Architecture
//!
//! A connector implements [`Connector`] plus one trait per capability it offers:
//!
//! - [`Connector`] - Naming, health check and shutdown
//! - [`CreateOp`], [`UpdateOp`], [`DeleteOp`] - Provisioning operations
//! - [`SearchOp`] - Filtered, paged and sorted search
//! - [`SyncOp`] - Incremental change feed with opaque tokens
//! - [`AuthenticateOp`] - Credential verification
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//!
//! let attrs = AttributeSet::new()
//!     .with(NAME_ATTRIBUTE, "CN=John Doe,OU=Staff,DC=corp,DC=example")
//!     .with("sAMAccountName", "jdoe");
//! let uid = connector.create(&ObjectClass::Account, attrs, &OperationOptions::new())?;
//!
//! connector.search(
//!     &ObjectClass::Account,
//!     Some(&Filter::eq("sAMAccountName", "jdoe")),
//!     &mut |object| {
//!         println!("{}", object.name());
//!         true
//!     },
//!     &OperationOptions::new().with_page_size(50),
//! )?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`error`] - Error taxonomy
//! - [`operation`] - Uid, `AttributeSet`, `AttributeValue`, update kinds
//! - [`filter`] - Filter model, rendering and parsing
//! - [`options`] - Typed operation options
//! - [`object`] - Object classes, normalized objects, sync deltas
//! - [`traits`] - Connector capability traits
//! - [`config`] - Configuration trait and shared settings

pub mod config;
pub mod error;
pub mod filter;
pub mod object;
pub mod operation;
pub mod options;
pub mod traits;

pub use error::{ConnectorError, ConnectorResult};

/// Everything a connector or its caller usually needs.
///
/// ```
/// use dirsync_connector::prelude::*;
/// ```
pub mod prelude {
    // Error handling
    pub use crate::error::{ConnectorError, ConnectorResult};

    // Traits
    pub use crate::traits::{
        AuthenticateOp, Connector, CreateOp, DeleteOp, FullCrud, SearchOp, SyncOp, UpdateOp,
    };

    // Objects
    pub use crate::object::{
        ConnectorObject, ObjectClass, SearchSummary, SyncDelta, SyncDeltaType, SyncSummary,
        SyncToken,
    };

    // Operations
    pub use crate::filter::Filter;
    pub use crate::operation::{
        AttributeSet, AttributeValue, Uid, UpdateType, ENABLE_ATTRIBUTE, NAME_ATTRIBUTE,
        PASSWORD_ATTRIBUTE, UID_ATTRIBUTE,
    };
    pub use crate::options::{OperationOptions, SearchScope, SortKey};

    // Configuration
    pub use crate::config::{ConnectionSettings, ConnectorConfig};
}
