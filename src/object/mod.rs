//! Object model capability set consumed by the sync core.
//!
//! The core never knows concrete engine types. An object participates in
//! synchronization by exposing a stable id, a registry of named properties
//! with declared kinds, generic get/set by name, a synchronous
//! property-changed event and, optionally, its children.

pub mod engine;
pub mod event;
pub mod value;

use std::sync::Arc;

use crate::error::SyncResult;
use crate::protocol::{ObjectId, PropertyValue};

pub use engine::{EngineObject, EngineObjectBuilder};
pub use event::{EventSource, Subscription};
pub use value::{decode_value, encode_value, ValueKind};

/// Registered property: name plus declared kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: ValueKind,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Payload of a local property-changed notification
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChanged {
    pub property: String,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

/// Structural change on an object's children
#[derive(Clone)]
pub enum ChildrenChanged {
    Added(Vec<Arc<dyn SyncObject>>),
    Removed(Vec<Arc<dyn SyncObject>>),
    /// Children were replaced wholesale
    Reset,
}

impl std::fmt::Debug for ChildrenChanged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = |items: &[Arc<dyn SyncObject>]| {
            items.iter().map(|o| o.id().to_string()).collect::<Vec<_>>()
        };
        match self {
            ChildrenChanged::Added(items) => f.debug_tuple("Added").field(&ids(items)).finish(),
            ChildrenChanged::Removed(items) => f.debug_tuple("Removed").field(&ids(items)).finish(),
            ChildrenChanged::Reset => f.write_str("Reset"),
        }
    }
}

/// Capability interface an engine object exposes to the sync core
pub trait SyncObject: Send + Sync + 'static {
    fn id(&self) -> &ObjectId;

    /// Fully-qualified type tag sent alongside changes
    fn type_name(&self) -> &str;

    fn properties(&self) -> Vec<PropertyDescriptor>;

    fn property(&self, name: &str) -> Option<PropertyDescriptor> {
        self.properties().into_iter().find(|p| p.name == name)
    }

    fn get_value(&self, name: &str) -> Option<PropertyValue>;

    /// Set through the ordinary mutation path, raising `property_changed`
    fn set_value(&self, name: &str, value: PropertyValue) -> SyncResult<()>;

    fn property_changed(&self) -> &EventSource<PropertyChanged>;

    fn children(&self) -> Vec<Arc<dyn SyncObject>> {
        Vec::new()
    }

    fn children_changed(&self) -> Option<&EventSource<ChildrenChanged>> {
        None
    }
}
