//! Aggregate roots for the Item context.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::{Clock, EventMetadata, EventPayload};
use keel_core::repository::EventRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    ItemCreated, ItemDeleted, ItemDescriptionUpdated, ItemEvent, ItemEventKind, ItemNameUpdated,
};

/// Longest accepted item name, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// Current field values of an item, as stored in the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    /// The owning user.
    pub owner_id: Uuid,
    /// Item name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Whether the item has been deleted.
    pub is_deleted: bool,
}

/// The aggregate root for an item.
#[derive(Debug)]
pub struct Item {
    /// Aggregate identifier.
    pub id: Uuid,
    /// Current version (event count).
    pub(crate) version: i64,
    state: ItemState,
    /// Events recorded since the item was loaded.
    pending_events: Vec<ItemEvent>,
}

fn validate_name(name: &str) -> Result<String, DomainError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::Validation("item name must not be blank".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::Validation(format!(
            "item name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_owned())
}

impl Item {
    fn blank(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: ItemState {
                owner_id: Uuid::nil(),
                name: String::new(),
                description: None,
                is_deleted: false,
            },
            pending_events: Vec::new(),
        }
    }

    /// Creates a new item owned by `owner_id`, producing an `ItemCreated`
    /// event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the name is blank or too long.
    pub fn create(
        owner_id: Uuid,
        name: &str,
        description: Option<String>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<Self, DomainError> {
        let name = validate_name(name)?;
        let mut item = Self::blank(Uuid::now_v7());
        item.record(
            ItemEventKind::Created(ItemCreated {
                item_id: item.id,
                owner_id,
                name,
                description,
            }),
            correlation_id,
            clock,
        );
        Ok(item)
    }

    /// Rebuilds an item from its stored history.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` for an empty history and
    /// `DomainError::Infrastructure` for an unreadable event.
    pub fn reconstitute(id: Uuid, history: &[EventRecord]) -> Result<Self, DomainError> {
        if history.is_empty() {
            return Err(DomainError::AggregateNotFound(id));
        }
        let mut item = Self::blank(id);
        for record in history {
            item.replay(&ItemEvent::from_record(record)?);
        }
        Ok(item)
    }

    /// Rebuilds an item from its projection row.
    #[must_use]
    pub fn from_state(id: Uuid, version: i64, state: ItemState) -> Self {
        Self {
            id,
            version,
            state,
            pending_events: Vec::new(),
        }
    }

    /// Current field values.
    #[must_use]
    pub fn state(&self) -> &ItemState {
        &self.state
    }

    /// The owning user.
    #[must_use]
    pub fn owner_id(&self) -> Uuid {
        self.state.owner_id
    }

    /// Item name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.state.description.as_deref()
    }

    /// Whether the item has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted
    }

    fn ensure_live(&self, action: &str) -> Result<(), DomainError> {
        if self.state.is_deleted {
            return Err(DomainError::BusinessRule(format!(
                "cannot {action} deleted item {}",
                self.id
            )));
        }
        Ok(())
    }

    fn record(&mut self, kind: ItemEventKind, correlation_id: Uuid, clock: &dyn Clock) {
        let event_kind = match &kind {
            ItemEventKind::Created(_) => ItemCreated::EVENT_KIND,
            ItemEventKind::NameUpdated(_) => ItemNameUpdated::EVENT_KIND,
            ItemEventKind::DescriptionUpdated(_) => ItemDescriptionUpdated::EVENT_KIND,
            ItemEventKind::Deleted(_) => ItemDeleted::EVENT_KIND,
        };
        let metadata = EventMetadata::new(
            event_kind,
            self.id,
            self.next_version(),
            correlation_id,
            clock,
        );
        self.apply(ItemEvent { metadata, kind });
    }

    /// Renames the item, producing an `ItemNameUpdated` event unless the
    /// name is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::BusinessRule` if the item is deleted and
    /// `DomainError::Validation` if the name is blank or too long.
    pub fn rename(
        &mut self,
        new_name: &str,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_live("rename")?;
        let new_name = validate_name(new_name)?;
        if new_name == self.state.name {
            return Ok(());
        }
        self.record(
            ItemEventKind::NameUpdated(ItemNameUpdated {
                item_id: self.id,
                new_name,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Replaces the description, producing an `ItemDescriptionUpdated`
    /// event unless it is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::BusinessRule` if the item is deleted.
    pub fn update_description(
        &mut self,
        new_description: Option<String>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_live("describe")?;
        if new_description == self.state.description {
            return Ok(());
        }
        self.record(
            ItemEventKind::DescriptionUpdated(ItemDescriptionUpdated {
                item_id: self.id,
                new_description,
            }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Deletes the item, producing an `ItemDeleted` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::BusinessRule` if the item is already deleted.
    pub fn delete(&mut self, correlation_id: Uuid, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_live("delete")?;
        self.record(
            ItemEventKind::Deleted(ItemDeleted { item_id: self.id }),
            correlation_id,
            clock,
        );
        Ok(())
    }
}

impl AggregateRoot for Item {
    type Event = ItemEvent;

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn replay(&mut self, event: &ItemEvent) {
        match &event.kind {
            ItemEventKind::Created(payload) => {
                self.state.owner_id = payload.owner_id;
                self.state.name.clone_from(&payload.name);
                self.state.description.clone_from(&payload.description);
            }
            ItemEventKind::NameUpdated(payload) => {
                self.state.name.clone_from(&payload.new_name);
            }
            ItemEventKind::DescriptionUpdated(payload) => {
                self.state.description.clone_from(&payload.new_description);
            }
            ItemEventKind::Deleted(_) => {
                self.state.is_deleted = true;
            }
        }
        self.version += 1;
    }

    fn pending_events(&self) -> &[ItemEvent] {
        &self.pending_events
    }

    fn pending_events_mut(&mut self) -> &mut Vec<ItemEvent> {
        &mut self.pending_events
    }
}

#[cfg(test)]
mod tests {
    use keel_core::event::DomainEvent;
    use keel_test_support::FixedClock;

    use super::*;

    fn new_item(clock: &FixedClock) -> Item {
        Item::create(
            Uuid::new_v4(),
            "Lamp",
            Some("brass".into()),
            Uuid::new_v4(),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_create_records_created_event_at_version_one() {
        // Arrange
        let clock = FixedClock::standard();
        let correlation_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();

        // Act
        let item = Item::create(owner_id, "  Lamp ", None, correlation_id, &clock).unwrap();

        // Assert
        assert_eq!(item.version(), 1);
        assert_eq!(item.name(), "Lamp");
        let events = item.pending_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_kind(), "item.created");
        assert_eq!(events[0].metadata.version, 1);
        assert_eq!(events[0].metadata.correlation_id, correlation_id);
        assert_eq!(events[0].metadata.occurred_on, clock.0);
        assert_eq!(
            events[0].kind,
            ItemEventKind::Created(ItemCreated {
                item_id: item.id,
                owner_id,
                name: "Lamp".into(),
                description: None,
            })
        );
    }

    #[test]
    fn test_create_rejects_blank_name_without_event() {
        let clock = FixedClock::standard();

        let result = Item::create(Uuid::new_v4(), "   ", None, Uuid::new_v4(), &clock);

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_version_counts_only_accepted_mutations() {
        let clock = FixedClock::standard();
        let cid = Uuid::new_v4();
        let mut item = new_item(&clock);

        item.rename("Lamp", cid, &clock).unwrap();
        item.rename("Desk lamp", cid, &clock).unwrap();
        item.update_description(Some("brass".into()), cid, &clock).unwrap();
        item.update_description(None, cid, &clock).unwrap();
        let rejected = item.rename("", cid, &clock);

        assert!(rejected.is_err());
        assert_eq!(item.version(), 3);
        assert_eq!(item.pending_events().len(), 3);
        let versions: Vec<i64> = item
            .pending_events()
            .iter()
            .map(|e| e.metadata.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(item.description(), None);
    }

    #[test]
    fn test_deleted_item_rejects_further_changes() {
        let clock = FixedClock::standard();
        let cid = Uuid::new_v4();
        let mut item = new_item(&clock);
        item.delete(cid, &clock).unwrap();

        let deleted_again = item.delete(cid, &clock);
        let renamed = item.rename("Other", cid, &clock);
        let described = item.update_description(None, cid, &clock);

        assert!(matches!(deleted_again, Err(DomainError::BusinessRule(_))));
        assert!(matches!(renamed, Err(DomainError::BusinessRule(_))));
        assert!(matches!(described, Err(DomainError::BusinessRule(_))));
        assert_eq!(item.version(), 2);
        assert!(item.is_deleted());
    }

    #[test]
    fn test_reconstitute_replays_stored_history() {
        let clock = FixedClock::standard();
        let cid = Uuid::new_v4();
        let mut original = new_item(&clock);
        original.rename("Desk lamp", cid, &clock).unwrap();
        let history: Vec<EventRecord> = original
            .pending_events()
            .iter()
            .map(DomainEvent::to_record)
            .collect();

        let item = Item::reconstitute(original.id, &history).unwrap();

        assert_eq!(item.version(), 2);
        assert_eq!(item.state(), original.state());
        assert!(item.pending_events().is_empty());
    }

    #[test]
    fn test_reconstitute_empty_history_is_not_found() {
        let id = Uuid::new_v4();

        let result = Item::reconstitute(id, &[]);

        assert!(matches!(result, Err(DomainError::AggregateNotFound(found)) if found == id));
    }
}
