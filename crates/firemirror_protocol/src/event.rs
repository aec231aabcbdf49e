//! Mirror events delivered to subscribers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// The key now holds a value (inserted or replaced).
    InsertOrUpdate,
    /// The key was removed.
    Delete,
}

/// Why a change was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// A local write, visible before any network round trip.
    Offline,
    /// Part of the hydration batch at startup.
    OnlineInitial,
    /// Live stream introduced a key that was not present locally.
    OnlineCreate,
    /// Live stream replaced the value of an existing key.
    OnlineUpdate,
    /// Live stream removed a key.
    OnlineDelete,
}

impl EventSource {
    /// Returns true for sources fed by the live change stream.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            EventSource::OnlineCreate | EventSource::OnlineUpdate | EventSource::OnlineDelete
        )
    }
}

/// One accepted mutation, as seen by subscribers.
///
/// Created exactly once per committed change and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirebaseEvent {
    key: String,
    object: Option<Value>,
    event_type: EventType,
    event_source: EventSource,
}

impl FirebaseEvent {
    /// Creates an insert-or-update event.
    pub fn upsert(key: impl Into<String>, object: Value, source: EventSource) -> Self {
        Self {
            key: key.into(),
            object: Some(object),
            event_type: EventType::InsertOrUpdate,
            event_source: source,
        }
    }

    /// Creates a delete event. The payload is the last known value, if any.
    pub fn delete(key: impl Into<String>, previous: Option<Value>, source: EventSource) -> Self {
        Self {
            key: key.into(),
            object: previous,
            event_type: EventType::Delete,
            event_source: source,
        }
    }

    /// The affected key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value carried by the event.
    pub fn object(&self) -> Option<&Value> {
        self.object.as_ref()
    }

    /// Whether the key was written or removed.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Why the change was observed.
    pub fn event_source(&self) -> EventSource {
        self.event_source
    }

    /// Deserializes the payload into a caller type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.object.clone().map(serde_json::from_value)
    }
}

/// A single key/value pair of the mirrored namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique key within the namespace.
    pub key: String,
    /// Caller-defined payload.
    pub value: Value,
}

impl Entry {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Dimensions {
        height: u32,
    }

    #[test]
    fn upsert_carries_payload() {
        let event = FirebaseEvent::upsert("dino1", json!({"height": 3}), EventSource::Offline);
        assert_eq!(event.key(), "dino1");
        assert_eq!(event.event_type(), EventType::InsertOrUpdate);
        assert_eq!(event.event_source(), EventSource::Offline);

        let dims: Dimensions = event.deserialize().unwrap().unwrap();
        assert_eq!(dims, Dimensions { height: 3 });
    }

    #[test]
    fn delete_without_payload() {
        let event = FirebaseEvent::delete("gone", None, EventSource::OnlineDelete);
        assert_eq!(event.event_type(), EventType::Delete);
        assert!(event.object().is_none());
        assert!(event.deserialize::<Dimensions>().is_none());
    }

    #[test]
    fn stream_sources() {
        assert!(EventSource::OnlineCreate.is_stream());
        assert!(EventSource::OnlineDelete.is_stream());
        assert!(!EventSource::OnlineInitial.is_stream());
        assert!(!EventSource::Offline.is_stream());
    }
}
