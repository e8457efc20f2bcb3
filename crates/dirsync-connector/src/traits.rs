//! Connector Framework traits
//!
//! Capability-based trait definitions for connectors, inspired by `ConnId`.
//! All operations are blocking; hosts wanting concurrency call them from a
//! pool of threads.

use crate::error::ConnectorResult;
use crate::filter::Filter;
use crate::object::{ConnectorObject, ObjectClass, SearchSummary, SyncDelta, SyncSummary, SyncToken};
use crate::operation::{AttributeSet, Uid, UpdateType, UID_ATTRIBUTE};
use crate::options::OperationOptions;

/// Base trait for all connectors.
pub trait Connector: Send + Sync {
    /// Get the display name for this connector instance.
    fn display_name(&self) -> &str;

    /// Validate configuration and check that the target system is usable.
    fn test(&self) -> ConnectorResult<()>;

    /// Dispose of connector resources.
    ///
    /// Implementations should close connections they keep open.
    fn dispose(&self) -> ConnectorResult<()>;
}

/// Capability for creating objects in the target system.
pub trait CreateOp: Connector {
    /// Create a new object in the target system.
    ///
    /// # Returns
    /// The unique identifier (UID) of the created object.
    fn create(
        &self,
        object_class: &ObjectClass,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;
}

/// Capability for updating objects in the target system.
pub trait UpdateOp: Connector {
    /// Apply `attributes` to the object according to `update_type`.
    ///
    /// Returns the object's UID after the update; a rename keeps the UID.
    fn update(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        update_type: UpdateType,
        attributes: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;

    /// Append values to the object's attributes.
    fn add_attribute_values(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        values: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.update(object_class, uid, UpdateType::Add, values, options)
    }

    /// Remove values from the object's attributes.
    fn remove_attribute_values(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        values: AttributeSet,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid> {
        self.update(object_class, uid, UpdateType::Delete, values, options)
    }
}

/// Capability for deleting objects from the target system.
pub trait DeleteOp: Connector {
    /// Delete an object from the target system.
    fn delete(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<()>;
}

/// Capability for searching objects in the target system.
pub trait SearchOp: Connector {
    /// Search for objects, delivering each one to `handler`.
    ///
    /// The handler returns `false` to stop the search early; stopping is not
    /// an error.
    fn search(
        &self,
        object_class: &ObjectClass,
        filter: Option<&Filter>,
        handler: &mut dyn FnMut(ConnectorObject) -> bool,
        options: &OperationOptions,
    ) -> ConnectorResult<SearchSummary>;

    /// Get a single object by UID.
    fn get(
        &self,
        object_class: &ObjectClass,
        uid: &Uid,
        options: &OperationOptions,
    ) -> ConnectorResult<Option<ConnectorObject>> {
        let filter = Filter::eq(UID_ATTRIBUTE, uid.value());
        let mut found = None;
        self.search(
            object_class,
            Some(&filter),
            &mut |object| {
                found = Some(object);
                false
            },
            options,
        )?;
        Ok(found)
    }
}

/// Capability for incremental synchronization.
pub trait SyncOp: Connector {
    /// Deliver every change after `token` to `handler` in change order.
    ///
    /// Each delta carries the token to persist once it has been applied. The
    /// handler returns `false` to stop early.
    fn sync(
        &self,
        object_class: &ObjectClass,
        token: Option<&SyncToken>,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
        options: &OperationOptions,
    ) -> ConnectorResult<SyncSummary>;

    /// Token marking the current state of the target system.
    fn latest_sync_token(&self, object_class: &ObjectClass) -> ConnectorResult<SyncToken>;
}

/// Capability for verifying account credentials.
pub trait AuthenticateOp: Connector {
    /// Verify `password` for `username` and return the account's UID.
    fn authenticate(
        &self,
        object_class: &ObjectClass,
        username: &str,
        password: &str,
        options: &OperationOptions,
    ) -> ConnectorResult<Uid>;
}

/// Marker trait for connectors that support all CRUD operations.
pub trait FullCrud: CreateOp + UpdateOp + DeleteOp + SearchOp {}

impl<T: CreateOp + UpdateOp + DeleteOp + SearchOp> FullCrud for T {}
