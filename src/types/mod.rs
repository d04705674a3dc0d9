//! Domain and wire types shared by the connection and the caches.

pub mod request;
pub mod response;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entity id of the view that is always listed first.
pub const DEFAULT_VIEW_ENTITY_ID: &str = "group.default_view";

/// Domain of group entities.
pub const GROUP_DOMAIN: &str = "group";

/// Snapshot of every known entity, keyed by `entity_id`.
pub type Entities = HashMap<String, Entity>;

/// Service descriptors keyed by domain, then service name.
pub type Services = HashMap<String, HashMap<String, ServiceDescriptor>>;

/// Registered frontend panels keyed by url path.
pub type Panels = Map<String, Value>;

/// A stateful object tracked by the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// `domain.object_id`
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl Entity {
    #[must_use]
    pub fn new<I: Into<String>, S: Into<String>>(entity_id: I, state: S) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
            last_changed: None,
            last_updated: None,
            context: None,
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        extract_domain(&self.entity_id)
    }

    #[must_use]
    pub fn object_id(&self) -> &str {
        extract_object_id(&self.entity_id)
    }

    /// Sort key used for groups and views.
    #[must_use]
    pub fn order(&self) -> Option<f64> {
        self.attributes.get("order").and_then(Value::as_f64)
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.flag("hidden")
    }

    /// Whether this entity represents a dashboard page.
    #[must_use]
    pub fn is_view(&self) -> bool {
        self.flag("view")
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.domain() == GROUP_DOMAIN
    }

    /// Member ids listed in the `entity_id` attribute of a group.
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .get("entity_id")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    fn flag(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Everything before the first `.` of an entity id.
#[must_use]
pub fn extract_domain(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map_or("", |(domain, _)| domain)
}

/// Everything after the first `.` of an entity id.
#[must_use]
pub fn extract_object_id(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map_or(entity_id, |(_, object_id)| object_id)
}

/// An event pushed by the server for an active subscription.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_fired: Option<DateTime<Utc>>,
}

impl Event {
    #[must_use]
    pub fn new<T: Into<String>>(event_type: T, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: None,
            time_fired: None,
        }
    }
}

/// Payload of a `state_changed` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateChanged {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<Entity>,
    #[serde(default)]
    pub new_state: Option<Entity>,
}

/// Core configuration as returned by `get_config`.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Loaded integrations
    #[serde(default)]
    pub components: BTreeSet<String>,
    /// Location, unit system, version and anything else the server reports
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Description of a callable service.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Value tagged with the sequence number of the inbound frame that carried it.
///
/// Frames are numbered in arrival order across the whole lifetime of a
/// connection, so a cache can tell whether an event was already reflected in a
/// fetch result.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sequenced<T> {
    pub seq: u64,
    pub value: T,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn domain_and_object_id() {
        assert_eq!(extract_domain("light.kitchen"), "light");
        assert_eq!(extract_object_id("light.kitchen"), "kitchen");
        assert_eq!(extract_object_id("sensor.outside.temp"), "outside.temp");
        assert_eq!(extract_domain("nodomain"), "");
    }

    #[test]
    fn group_entity_accessors() {
        let group: Entity = serde_json::from_value(json!({
            "entity_id": "group.living_room",
            "state": "on",
            "attributes": {
                "entity_id": ["light.a", "light.b"],
                "order": 3,
                "view": true,
                "hidden": false
            },
            "last_changed": "2016-11-26T01:37:24.265390+00:00",
            "last_updated": "2016-11-26T01:37:24.265390+00:00"
        }))
        .unwrap();

        assert!(group.is_group(), "group domain");
        assert!(group.is_view(), "view flag");
        assert!(!group.is_hidden(), "not hidden");
        assert_eq!(group.order(), Some(3.0));
        assert_eq!(group.member_ids().collect::<Vec<_>>(), ["light.a", "light.b"]);
        assert!(group.last_changed.is_some(), "timestamp parsed");
    }

    #[test]
    fn core_config_keeps_unknown_fields() {
        let core: CoreConfig = serde_json::from_value(json!({
            "components": ["http", "frontend", "http"],
            "latitude": 32.87,
            "version": "0.34.0"
        }))
        .unwrap();

        assert_eq!(core.components.len(), 2);
        assert_eq!(core.extra["version"], json!("0.34.0"));
    }
}
