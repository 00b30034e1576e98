//! Wire format of an event message.
//!
//! A message is one JSON object: the envelope fields below plus the
//! kind-specific fields of the payload at the top level. The topic names
//! the kind, so the body carries no type tag of its own.

use chrono::{DateTime, Utc};
use keel_core::repository::EventRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;

/// A decoded event message with payload `P`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage<P> {
    /// Unique event identifier; idempotency key for handlers.
    pub event_id: Uuid,
    /// When the event happened.
    pub occurred_on: DateTime<Utc>,
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Position in the aggregate stream.
    pub version: i64,
    /// Correlation ID of the originating command.
    pub correlation_id: Uuid,
    /// Kind-specific fields.
    #[serde(flatten)]
    pub payload: P,
}

impl EventMessage<serde_json::Value> {
    /// Builds the untyped message for a stored event.
    #[must_use]
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            occurred_on: record.occurred_on,
            aggregate_id: record.aggregate_id,
            version: record.version,
            correlation_id: record.correlation_id,
            payload: record.payload.clone(),
        }
    }
}

/// Serializes a stored event to its message body.
///
/// # Errors
///
/// Returns `BrokerError::Serialization` when the payload is not a JSON
/// object.
pub fn encode(record: &EventRecord) -> Result<Vec<u8>, BrokerError> {
    if !record.payload.is_object() {
        return Err(BrokerError::Serialization(serde::ser::Error::custom(
            format!("payload of event {} is not a JSON object", record.event_id),
        )));
    }
    Ok(serde_json::to_vec(&EventMessage::from_record(record))?)
}

/// Deserializes a message body.
///
/// # Errors
///
/// Returns `BrokerError::Serialization` when the body is not valid JSON or
/// does not match `P`.
pub fn decode<P: serde::de::DeserializeOwned>(body: &[u8]) -> Result<EventMessage<P>, BrokerError> {
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        item_id: Uuid,
        new_name: String,
    }

    fn record(payload: serde_json::Value) -> EventRecord {
        EventRecord {
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            event_kind: "item.name_updated".to_owned(),
            payload,
            version: 2,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::new_v4(),
            occurred_on: Utc::now(),
        }
    }

    #[test]
    fn test_body_is_flat_object_with_envelope_and_payload_fields() {
        let item_id = Uuid::new_v4();
        let stored = record(serde_json::json!({"item_id": item_id, "new_name": "Lamp"}));

        let body: serde_json::Value = serde_json::from_slice(&encode(&stored).unwrap()).unwrap();

        assert_eq!(body["event_id"], serde_json::json!(stored.event_id));
        assert_eq!(body["version"], 2);
        assert_eq!(body["new_name"], "Lamp");
        assert!(body.get("payload").is_none());
        assert!(body.get("occurred_on").is_some());
    }

    #[test]
    fn test_decode_into_typed_payload() {
        let item_id = Uuid::new_v4();
        let stored = record(serde_json::json!({"item_id": item_id, "new_name": "Lamp"}));

        let message: EventMessage<Renamed> = decode(&encode(&stored).unwrap()).unwrap();

        assert_eq!(message.event_id, stored.event_id);
        assert_eq!(
            message.payload,
            Renamed {
                item_id,
                new_name: "Lamp".to_owned()
            }
        );
    }

    #[test]
    fn test_decode_rejects_missing_payload_field() {
        let stored = record(serde_json::json!({"item_id": Uuid::new_v4()}));

        let result = decode::<Renamed>(&encode(&stored).unwrap());

        assert!(matches!(result, Err(BrokerError::Serialization(_))));
    }

    #[test]
    fn test_encode_rejects_non_object_payload() {
        let stored = record(serde_json::json!("just a string"));

        assert!(encode(&stored).is_err());
    }
}
