use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque serialized property payload.
///
/// Primitives travel as JSON scalars, structured values as their JSON text.
pub type PropertyValue = serde_json::Value;

/// Source tag used when a binding is enabled without an explicit source id
pub const LOCAL_CLIENT: &str = "local-client";

/// Stable identifier of an engine object, unique within a project graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One property mutation, as sent over the wire.
///
/// Never mutated after construction: the `with_*` methods consume and
/// return a new value, and receivers only ever see it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub object_id: ObjectId,
    pub property_name: String,
    #[serde(default)]
    pub new_value: PropertyValue,
    #[serde(default)]
    pub old_value: PropertyValue,
    /// Wall clock at origin, informational only
    pub timestamp: DateTime<Utc>,
    pub change_source: String,
    #[serde(default)]
    pub session_id: String,
    /// Per-object, sender-assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type_name: Option<String>,
}

impl ChangeNotification {
    pub fn new(
        object_id: impl Into<ObjectId>,
        property_name: impl Into<String>,
        new_value: PropertyValue,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            property_name: property_name.into(),
            new_value,
            old_value: PropertyValue::Null,
            timestamp: Utc::now(),
            change_source: LOCAL_CLIENT.to_string(),
            session_id: String::new(),
            sequence_number: None,
            object_type_name: None,
        }
    }

    pub fn with_old_value(mut self, old_value: PropertyValue) -> Self {
        self.old_value = old_value;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.change_source = source.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.object_type_name = Some(type_name.into());
        self
    }

    /// Short `object.property` label for log lines
    pub fn target(&self) -> String {
        format!("{}.{}", self.object_id, self.property_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_stamps_metadata() {
        let change = ChangeNotification::new("x1", "Name", json!("Hello"))
            .with_old_value(json!("Untitled"))
            .with_source("Alice")
            .with_session_id("S")
            .with_sequence(1)
            .with_type_name("demo.Element");

        assert_eq!(change.object_id.as_str(), "x1");
        assert_eq!(change.change_source, "Alice");
        assert_eq!(change.session_id, "S");
        assert_eq!(change.sequence_number, Some(1));
        assert_eq!(change.object_type_name.as_deref(), Some("demo.Element"));
        assert_eq!(change.target(), "x1.Name");
    }

    #[test]
    fn defaults_to_local_client_without_sequence() {
        let change = ChangeNotification::new("x1", "Opacity", json!(0.5));
        assert_eq!(change.change_source, LOCAL_CLIENT);
        assert_eq!(change.sequence_number, None);
        assert!(change.old_value.is_null());
    }

    #[test]
    fn sequence_is_optional_on_the_wire() {
        let raw = json!({
            "object_id": "x1",
            "property_name": "Name",
            "new_value": "Hi",
            "timestamp": "2024-01-01T00:00:00Z",
            "change_source": "Bob"
        });
        let change: ChangeNotification = serde_json::from_value(raw).unwrap();
        assert_eq!(change.sequence_number, None);
        assert_eq!(change.session_id, "");
        assert!(change.old_value.is_null());

        let encoded = serde_json::to_value(&change).unwrap();
        assert!(encoded.get("sequence_number").is_none());
    }
}
