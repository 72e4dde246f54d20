use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Opaque, stable identifier of a tracked entity (user id, message id, ...).
pub type EntityId = String;

/// # Entity Payload
///
/// Contract every domain payload fulfils so the generic core can read the
/// explicit online/offline bit and find the id its enrichment is keyed by.
pub trait EntityPayload: Clone + Send + Sync + 'static {
    /// Explicit live bit, distinct from staleness. `None` when the payload has
    /// no notion of being online (e.g. a chat message).
    fn live_flag(&self) -> Option<bool> {
        None
    }

    /// Sets the live bit. Payloads without one ignore the call.
    fn set_live_flag(&mut self, _live: bool) {}

    /// Id the enrichment record for this payload is keyed by. Defaults to the
    /// entity id itself.
    fn enrichment_key<'a>(&'a self, entity_id: &'a str) -> Option<&'a str> {
        Some(entity_id)
    }
}

/// Untyped payloads carry their live bit in a `live_flag` boolean field.
impl EntityPayload for Value {
    fn live_flag(&self) -> Option<bool> {
        self.get("live_flag").and_then(Value::as_bool)
    }

    fn set_live_flag(&mut self, live: bool) {
        if let Value::Object(map) = self {
            map.insert("live_flag".to_string(), Value::Bool(live));
        }
    }
}

/// The latest known state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity<P> {
    /// Stable id, unique within one store.
    pub entity_id: EntityId,
    /// Domain-specific fields.
    pub payload: P,
    /// Unix milliseconds of the last update applied.
    pub updated_at: i64,
    /// Explicit online/offline bit captured from the payload.
    pub live_flag: Option<bool>,
}

impl<P: EntityPayload> TrackedEntity<P> {
    /// Builds an entity, capturing the live bit from the payload.
    pub fn new(entity_id: impl Into<EntityId>, payload: P, updated_at: i64) -> Self {
        let live_flag = payload.live_flag();
        Self {
            entity_id: entity_id.into(),
            payload,
            updated_at,
            live_flag,
        }
    }

    /// True when the payload explicitly says the entity went offline.
    pub fn is_retired(&self) -> bool {
        self.live_flag == Some(false)
    }
}

/// Kind of change carried by a `ChangeEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A new row; replaces the entity if it already exists.
    Insert,
    /// A changed row; creates the entity if it is unknown.
    Update,
    /// The row is gone. Authoritative, not subject to staleness.
    Delete,
}

/// One change notification delivered by the pub/sub collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<P> {
    /// Id of the changed entity.
    pub entity_id: EntityId,
    /// What happened to it.
    pub operation: Operation,
    /// New payload for insert/update; the last payload (if any) for delete.
    pub payload: Option<P>,
    /// Commit time in Unix milliseconds.
    pub timestamp: i64,
}

impl ChangeEvent<Value> {
    /// Decodes the raw JSON payload into a typed payload.
    pub fn decode<P: DeserializeOwned>(self) -> Result<ChangeEvent<P>, SyncError> {
        let payload = match self.payload {
            Some(raw) => Some(serde_json::from_value(raw)?),
            None => None,
        };
        Ok(ChangeEvent {
            entity_id: self.entity_id,
            operation: self.operation,
            payload,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_payload_reads_and_writes_live_flag() {
        let mut payload = json!({ "lat": 1.0, "live_flag": true });
        assert_eq!(payload.live_flag(), Some(true));

        payload.set_live_flag(false);
        assert_eq!(payload.live_flag(), Some(false));
        assert_eq!(json!({ "lat": 1.0 }).live_flag(), None);
    }

    #[test]
    fn test_tracked_entity_captures_flag_from_payload() {
        let entity = TrackedEntity::new("rider-1", json!({ "live_flag": false }), 42);
        assert!(entity.is_retired());
        assert_eq!(entity.updated_at, 42);
    }

    #[test]
    fn test_change_event_decode_rejects_wrong_shape() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            speed: f64,
        }

        let raw = ChangeEvent {
            entity_id: "a".to_string(),
            operation: Operation::Update,
            payload: Some(json!({ "speed": "fast" })),
            timestamp: 1,
        };
        assert!(matches!(raw.decode::<Strict>(), Err(SyncError::Decode(_))));
    }
}
