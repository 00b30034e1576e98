//! Domain events for the Item context.

use keel_core::error::DomainError;
use keel_core::event::{DomainEvent, EventMetadata, EventPayload};
use keel_core::repository::EventRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emitted when an item is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCreated {
    /// The item identifier.
    pub item_id: Uuid,
    /// The owning user.
    pub owner_id: Uuid,
    /// Initial name.
    pub name: String,
    /// Initial description.
    pub description: Option<String>,
}

impl EventPayload for ItemCreated {
    const EVENT_KIND: &'static str = "item.created";
}

/// Emitted when an item is renamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemNameUpdated {
    /// The item identifier.
    pub item_id: Uuid,
    /// The new name.
    pub new_name: String,
}

impl EventPayload for ItemNameUpdated {
    const EVENT_KIND: &'static str = "item.name_updated";
}

/// Emitted when an item's description changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptionUpdated {
    /// The item identifier.
    pub item_id: Uuid,
    /// The new description; `None` clears it.
    pub new_description: Option<String>,
}

impl EventPayload for ItemDescriptionUpdated {
    const EVENT_KIND: &'static str = "item.description_updated";
}

/// Emitted when an item is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDeleted {
    /// The item identifier.
    pub item_id: Uuid,
}

impl EventPayload for ItemDeleted {
    const EVENT_KIND: &'static str = "item.deleted";
}

/// Event payload variants for the Item context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemEventKind {
    /// The item was created.
    Created(ItemCreated),
    /// The item was renamed.
    NameUpdated(ItemNameUpdated),
    /// The description changed.
    DescriptionUpdated(ItemDescriptionUpdated),
    /// The item was deleted.
    Deleted(ItemDeleted),
}

/// Domain event envelope for the Item context.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: ItemEventKind,
}

fn payload<P: DeserializeOwned>(record: &EventRecord) -> Result<P, DomainError> {
    serde_json::from_value(record.payload.clone()).map_err(|e| {
        DomainError::Infrastructure(format!(
            "event {} ({}) could not be read: {e}",
            record.event_id, record.event_kind
        ))
    })
}

impl ItemEvent {
    /// Rebuilds an event from its stored row.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for an unknown kind or a
    /// payload that does not match it.
    pub fn from_record(record: &EventRecord) -> Result<Self, DomainError> {
        let kind = match record.event_kind.as_str() {
            k if k == ItemCreated::EVENT_KIND => ItemEventKind::Created(payload(record)?),
            k if k == ItemNameUpdated::EVENT_KIND => {
                ItemEventKind::NameUpdated(payload(record)?)
            }
            k if k == ItemDescriptionUpdated::EVENT_KIND => {
                ItemEventKind::DescriptionUpdated(payload(record)?)
            }
            k if k == ItemDeleted::EVENT_KIND => ItemEventKind::Deleted(payload(record)?),
            other => {
                return Err(DomainError::Infrastructure(format!(
                    "unknown item event kind '{other}'"
                )));
            }
        };
        Ok(Self {
            metadata: EventMetadata::from_record(record),
            kind,
        })
    }
}

impl DomainEvent for ItemEvent {
    fn event_kind(&self) -> &'static str {
        match &self.kind {
            ItemEventKind::Created(_) => ItemCreated::EVENT_KIND,
            ItemEventKind::NameUpdated(_) => ItemNameUpdated::EVENT_KIND,
            ItemEventKind::DescriptionUpdated(_) => ItemDescriptionUpdated::EVENT_KIND,
            ItemEventKind::Deleted(_) => ItemDeleted::EVENT_KIND,
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        match &self.kind {
            ItemEventKind::Created(p) => serde_json::json!({
                "item_id": p.item_id,
                "owner_id": p.owner_id,
                "name": p.name,
                "description": p.description,
            }),
            ItemEventKind::NameUpdated(p) => serde_json::json!({
                "item_id": p.item_id,
                "new_name": p.new_name,
            }),
            ItemEventKind::DescriptionUpdated(p) => serde_json::json!({
                "item_id": p.item_id,
                "new_description": p.new_description,
            }),
            ItemEventKind::Deleted(p) => serde_json::json!({ "item_id": p.item_id }),
        }
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
