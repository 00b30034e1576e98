//! Domain events for the IAM context.

use keel_core::error::DomainError;
use keel_core::event::{DomainEvent, EventMetadata, EventPayload};
use keel_core::repository::EventRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emitted when a user registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    /// The user identifier.
    pub user_id: Uuid,
    /// Unique login name.
    pub username: String,
    /// Contact address.
    pub email: String,
}

impl EventPayload for UserRegistered {
    const EVENT_KIND: &'static str = "user.registered";
}

/// Emitted when an active user is deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeactivated {
    /// The user identifier.
    pub user_id: Uuid,
}

impl EventPayload for UserDeactivated {
    const EVENT_KIND: &'static str = "user.deactivated";
}

/// Emitted when an inactive user is activated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivated {
    /// The user identifier.
    pub user_id: Uuid,
}

impl EventPayload for UserActivated {
    const EVENT_KIND: &'static str = "user.activated";
}

/// Emitted when profile fields change. Carries the resulting values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileUpdated {
    /// The user identifier.
    pub user_id: Uuid,
    /// Contact address after the update.
    pub email: String,
    /// Avatar URL after the update.
    pub profile_picture_url: Option<String>,
}

impl EventPayload for UserProfileUpdated {
    const EVENT_KIND: &'static str = "user.profile_updated";
}

/// Event payload variants for the IAM context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEventKind {
    /// The user registered.
    Registered(UserRegistered),
    /// The user was deactivated.
    Deactivated(UserDeactivated),
    /// The user was activated.
    Activated(UserActivated),
    /// Profile fields changed.
    ProfileUpdated(UserProfileUpdated),
}

/// Domain event envelope for the IAM context.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: UserEventKind,
}

fn decode<P: DeserializeOwned>(record: &EventRecord) -> Result<P, DomainError> {
    serde_json::from_value(record.payload.clone()).map_err(|e| {
        DomainError::Infrastructure(format!(
            "event {} ({}) could not be read: {e}",
            record.event_id, record.event_kind
        ))
    })
}

fn encode<P: Serialize>(payload: &P) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or(serde_json::Value::Null)
}

impl UserEvent {
    /// Rebuilds an event from its stored row.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for an unknown kind or a
    /// payload that does not match it.
    pub fn from_record(record: &EventRecord) -> Result<Self, DomainError> {
        let kind = match record.event_kind.as_str() {
            k if k == UserRegistered::EVENT_KIND => UserEventKind::Registered(decode(record)?),
            k if k == UserDeactivated::EVENT_KIND => UserEventKind::Deactivated(decode(record)?),
            k if k == UserActivated::EVENT_KIND => UserEventKind::Activated(decode(record)?),
            k if k == UserProfileUpdated::EVENT_KIND => {
                UserEventKind::ProfileUpdated(decode(record)?)
            }
            other => {
                return Err(DomainError::Infrastructure(format!(
                    "unknown user event kind '{other}'"
                )));
            }
        };
        Ok(Self {
            metadata: EventMetadata::from_record(record),
            kind,
        })
    }
}

impl DomainEvent for UserEvent {
    fn event_kind(&self) -> &'static str {
        match &self.kind {
            UserEventKind::Registered(_) => UserRegistered::EVENT_KIND,
            UserEventKind::Deactivated(_) => UserDeactivated::EVENT_KIND,
            UserEventKind::Activated(_) => UserActivated::EVENT_KIND,
            UserEventKind::ProfileUpdated(_) => UserProfileUpdated::EVENT_KIND,
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        match &self.kind {
            UserEventKind::Registered(p) => encode(p),
            UserEventKind::Deactivated(p) => encode(p),
            UserEventKind::Activated(p) => encode(p),
            UserEventKind::ProfileUpdated(p) => encode(p),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use keel_core::event::SystemClock;

    use super::*;

    #[test]
    fn test_payload_round_trips_through_the_stored_record() {
        let user_id = Uuid::new_v4();
        let event = UserEvent {
            metadata: EventMetadata::new(
                UserRegistered::EVENT_KIND,
                user_id,
                1,
                Uuid::new_v4(),
                &SystemClock,
            ),
            kind: UserEventKind::Registered(UserRegistered {
                user_id,
                username: "ada".into(),
                email: "ada@example.com".into(),
            }),
        };

        let record = event.to_record();
        let rebuilt = UserEvent::from_record(&record).unwrap();

        assert_eq!(record.event_kind, "user.registered");
        assert_eq!(record.payload["username"], "ada");
        assert_eq!(rebuilt, event);
    }

    #[test]
    fn test_unknown_kind_is_an_infrastructure_error() {
        let event = UserEvent {
            metadata: EventMetadata::new(
                UserActivated::EVENT_KIND,
                Uuid::new_v4(),
                1,
                Uuid::new_v4(),
                &SystemClock,
            ),
            kind: UserEventKind::Activated(UserActivated {
                user_id: Uuid::new_v4(),
            }),
        };
        let mut record = event.to_record();
        record.event_kind = "user.vanished".into();

        let result = UserEvent::from_record(&record);

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
