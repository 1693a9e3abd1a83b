//! In-memory engine object: a typed property bag with ordered children.
//!
//! Stands in for a host document model in tests, the demo and embedders
//! that have no object model of their own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ChildrenChanged, EventSource, PropertyChanged, PropertyDescriptor, SyncObject, ValueKind};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ObjectId, PropertyValue};

pub struct EngineObject {
    id: ObjectId,
    type_name: String,
    descriptors: Vec<PropertyDescriptor>,
    values: RwLock<HashMap<String, PropertyValue>>,
    children: RwLock<Vec<Arc<dyn SyncObject>>>,
    property_changed: EventSource<PropertyChanged>,
    children_changed: EventSource<ChildrenChanged>,
}

impl EngineObject {
    pub fn builder(id: impl Into<ObjectId>, type_name: impl Into<String>) -> EngineObjectBuilder {
        EngineObjectBuilder {
            id: id.into(),
            type_name: type_name.into(),
            descriptors: Vec::new(),
            values: HashMap::new(),
            children: Vec::new(),
        }
    }

    /// Typed convenience over [`SyncObject::set_value`]
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> SyncResult<()> {
        self.set_value(name, value.into())
    }

    pub fn get(&self, name: &str) -> PropertyValue {
        self.get_value(name).unwrap_or(PropertyValue::Null)
    }

    pub fn add_child(&self, child: Arc<dyn SyncObject>) {
        self.children.write().push(Arc::clone(&child));
        self.children_changed.emit(&ChildrenChanged::Added(vec![child]));
    }

    pub fn remove_child(&self, id: &ObjectId) -> Option<Arc<dyn SyncObject>> {
        let removed = {
            let mut children = self.children.write();
            let index = children.iter().position(|c| c.id() == id)?;
            children.remove(index)
        };
        self.children_changed
            .emit(&ChildrenChanged::Removed(vec![Arc::clone(&removed)]));
        Some(removed)
    }

    /// Replace every child at once
    pub fn reset_children(&self, children: Vec<Arc<dyn SyncObject>>) {
        *self.children.write() = children;
        self.children_changed.emit(&ChildrenChanged::Reset);
    }
}

impl SyncObject for EngineObject {
    fn id(&self) -> &ObjectId {
        &self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        self.descriptors.clone()
    }

    fn property(&self, name: &str) -> Option<PropertyDescriptor> {
        self.descriptors.iter().find(|d| d.name == name).cloned()
    }

    fn get_value(&self, name: &str) -> Option<PropertyValue> {
        self.values.read().get(name).cloned()
    }

    fn set_value(&self, name: &str, value: PropertyValue) -> SyncResult<()> {
        let descriptor = self.property(name).ok_or_else(|| SyncError::UnknownProperty {
            object_id: self.id.to_string(),
            property: name.to_string(),
        })?;

        if !descriptor.kind.accepts(&value) {
            return Err(SyncError::Conversion {
                property: name.to_string(),
                expected: descriptor.kind,
                reason: format!("value {value} has the wrong type"),
            });
        }

        let old_value = {
            let mut values = self.values.write();
            let old = values.get(name).cloned().unwrap_or(PropertyValue::Null);
            if old == value {
                return Ok(());
            }
            values.insert(name.to_string(), value.clone());
            old
        };

        // Raised outside the lock so handlers can read the new value
        self.property_changed.emit(&PropertyChanged {
            property: name.to_string(),
            old_value,
            new_value: value,
        });
        Ok(())
    }

    fn property_changed(&self) -> &EventSource<PropertyChanged> {
        &self.property_changed
    }

    fn children(&self) -> Vec<Arc<dyn SyncObject>> {
        self.children.read().clone()
    }

    fn children_changed(&self) -> Option<&EventSource<ChildrenChanged>> {
        Some(&self.children_changed)
    }
}

pub struct EngineObjectBuilder {
    id: ObjectId,
    type_name: String,
    descriptors: Vec<PropertyDescriptor>,
    values: HashMap<String, PropertyValue>,
    children: Vec<Arc<dyn SyncObject>>,
}

impl EngineObjectBuilder {
    pub fn property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.descriptors.push(PropertyDescriptor::new(name, kind));
        self
    }

    /// Register a property with an initial value (no change event is raised)
    pub fn value(mut self, name: impl Into<String>, kind: ValueKind, initial: impl Into<PropertyValue>) -> Self {
        let name = name.into();
        self.values.insert(name.clone(), initial.into());
        self.descriptors.push(PropertyDescriptor::new(name, kind));
        self
    }

    pub fn child(mut self, child: Arc<dyn SyncObject>) -> Self {
        self.children.push(child);
        self
    }

    pub fn build(self) -> Arc<EngineObject> {
        Arc::new(EngineObject {
            id: self.id,
            type_name: self.type_name,
            descriptors: self.descriptors,
            values: RwLock::new(self.values),
            children: RwLock::new(self.children),
            property_changed: EventSource::new(),
            children_changed: EventSource::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn element(id: &str) -> Arc<EngineObject> {
        EngineObject::builder(id, "demo.Element")
            .property("Name", ValueKind::Text)
            .value("Opacity", ValueKind::Float, 1.0)
            .build()
    }

    #[test]
    fn set_raises_change_with_old_value() {
        let obj = element("e1");
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = obj.property_changed().subscribe(move |e| sink.lock().push(e.clone()));

        obj.set("Opacity", 0.5).unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value, json!(1.0));
        assert_eq!(events[0].new_value, json!(0.5));
    }

    #[test]
    fn setting_equal_value_is_silent() {
        let obj = element("e1");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = obj.property_changed().subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        obj.set("Name", "a").unwrap();
        obj.set("Name", "a").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_unknown_and_mistyped_properties() {
        let obj = element("e1");
        assert!(matches!(obj.set("Missing", 1), Err(SyncError::UnknownProperty { .. })));
        assert!(matches!(obj.set("Name", 1), Err(SyncError::Conversion { .. })));
        assert_eq!(obj.get("Name"), PropertyValue::Null);
    }

    #[test]
    fn structural_changes_are_announced() {
        let parent = element("p");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = parent
            .children_changed()
            .expect("engine objects expose children")
            .subscribe(move |e| sink.lock().push(format!("{e:?}")));

        parent.add_child(element("c1"));
        assert!(parent.remove_child(&ObjectId::from("c1")).is_some());
        assert!(parent.remove_child(&ObjectId::from("c1")).is_none());

        assert_eq!(*seen.lock(), vec!["Added([\"c1\"])", "Removed([\"c1\"])"]);
        assert!(parent.children().is_empty());
    }
}
