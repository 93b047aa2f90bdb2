//! Change notification contract between the store and its observers.
//!
//! Every successful write produces a [`ChangeEvent`] carrying the object
//! before and after the write. Subscribers implement [`ChangeHandler`] and
//! are invoked synchronously, after the write transaction has committed.
//!
//! Observers must not assume gap-free delivery: an event describes only the
//! two states it carries.

use crate::types::{
    ControlPlaneContext, DeviceClass, Node, ObjectKey, ResourceClaim, ResourceSlice,
};

/// Closed set of object kinds that can appear in a change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedObject {
    ResourceClaim(ResourceClaim),
    ControlPlaneContext(ControlPlaneContext),
    DeviceClass(DeviceClass),
    ResourceSlice(ResourceSlice),
    Node(Node),
    /// Deleted object whose final state was not observed; wraps the last
    /// known state.
    Tombstone(Box<WatchedObject>),
}

impl WatchedObject {
    /// Strip any tombstone wrapping.
    pub fn unwrap_tombstone(&self) -> &WatchedObject {
        match self {
            WatchedObject::Tombstone(inner) => inner.unwrap_tombstone(),
            other => other,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, WatchedObject::Tombstone(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WatchedObject::ResourceClaim(_) => "ResourceClaim",
            WatchedObject::ControlPlaneContext(_) => "ControlPlaneContext",
            WatchedObject::DeviceClass(_) => "DeviceClass",
            WatchedObject::ResourceSlice(_) => "ResourceSlice",
            WatchedObject::Node(_) => "Node",
            WatchedObject::Tombstone(_) => "Tombstone",
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            WatchedObject::ResourceClaim(o) => o.meta.key(),
            WatchedObject::ControlPlaneContext(o) => o.meta.key(),
            WatchedObject::DeviceClass(o) => o.meta.key(),
            WatchedObject::ResourceSlice(o) => o.meta.key(),
            WatchedObject::Node(n) => ObjectKey::cluster_scoped(&n.name),
            WatchedObject::Tombstone(inner) => inner.key(),
        }
    }
}

/// What kind of transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// An `(old, new)` pair for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub old: Option<WatchedObject>,
    pub new: Option<WatchedObject>,
}

impl ChangeEvent {
    pub fn added(obj: WatchedObject) -> Self {
        Self {
            old: None,
            new: Some(obj),
        }
    }

    pub fn updated(old: WatchedObject, new: WatchedObject) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn deleted(old: WatchedObject) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// A missing or tombstoned new state is a deletion.
    pub fn action(&self) -> ChangeAction {
        match (&self.old, &self.new) {
            (_, None) => ChangeAction::Delete,
            (_, Some(new)) if new.is_tombstone() => ChangeAction::Delete,
            (None, Some(_)) => ChangeAction::Add,
            (Some(_), Some(_)) => ChangeAction::Update,
        }
    }
}

/// Receives store change notifications.
pub trait ChangeHandler: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}
