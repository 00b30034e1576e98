//! Item persistence: event stream plus the `items` projection, both written
//! through the session of the current unit of work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use keel_core::repository::{EventRecord, EventStore, ProjectionRow, ProjectionStore};
use keel_core::session::{AggregateRepository, Repository, Session, SessionHandle};
use tracing::debug;
use uuid::Uuid;

use crate::domain::aggregates::{Item, ItemState};

/// Projection name of the item read model.
pub const ITEMS_PROJECTION: &str = "items";

/// Repository for [`Item`] aggregates, bound to one unit of work.
///
/// Remembers the highest version it has saved per item so that saving the
/// same aggregate twice in one scope appends each event once.
pub struct ItemRepository<S> {
    session: SessionHandle<S>,
    saved: Arc<Mutex<HashMap<Uuid, i64>>>,
}

impl<S> Clone for ItemRepository<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            saved: Arc::clone(&self.saved),
        }
    }
}

impl<S> std::fmt::Debug for ItemRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRepository").finish_non_exhaustive()
    }
}

impl<S> Repository<S> for ItemRepository<S>
where
    S: Session + EventStore + ProjectionStore,
{
    fn bind(session: SessionHandle<S>) -> Self {
        Self {
            session,
            saved: Arc::default(),
        }
    }
}

fn item_from_row(row: ProjectionRow) -> Result<Item, DomainError> {
    let state: ItemState = serde_json::from_value(row.state).map_err(|e| {
        DomainError::Infrastructure(format!(
            "items projection row {} could not be read: {e}",
            row.aggregate_id
        ))
    })?;
    Ok(Item::from_state(row.aggregate_id, row.version, state))
}

fn items_from_rows(rows: Vec<ProjectionRow>) -> Result<Vec<Item>, DomainError> {
    rows.into_iter().map(item_from_row).collect()
}

#[async_trait]
impl<S> AggregateRepository<Item> for ItemRepository<S>
where
    S: Session + EventStore + ProjectionStore,
{
    async fn save(&self, aggregate: &Item) -> Result<i64, DomainError> {
        ItemRepository::save(self, aggregate).await
    }
}

impl<S> ItemRepository<S>
where
    S: Session + EventStore + ProjectionStore,
{
    fn saved_version(&self, item_id: Uuid) -> Option<i64> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&item_id)
            .copied()
    }

    fn remember_saved(&self, item_id: Uuid, version: i64) {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item_id, version);
    }

    /// Fetches an item owned by `owner_id` from the projection.
    ///
    /// Items of other owners are reported as absent.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn get(&self, item_id: Uuid, owner_id: Uuid) -> Result<Option<Item>, DomainError> {
        Ok(self
            .get_any(item_id)
            .await?
            .filter(|item| item.owner_id() == owner_id))
    }

    /// Fetches an item from the projection regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn get_any(&self, item_id: Uuid) -> Result<Option<Item>, DomainError> {
        let row = self
            .session
            .acquire()
            .await?
            .fetch_projection(ITEMS_PROJECTION, item_id)
            .await?;
        row.map(item_from_row).transpose()
    }

    /// Rebuilds an item from its event stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the stream is empty.
    pub async fn load(&self, item_id: Uuid) -> Result<Item, DomainError> {
        let history = self.session.acquire().await?.load_events(item_id).await?;
        Item::reconstitute(item_id, &history)
    }

    /// Lists the items of one owner, deleted ones included.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<Item>, DomainError> {
        let rows = self
            .session
            .acquire()
            .await?
            .find_projections(ITEMS_PROJECTION, "owner_id", &owner_id.to_string())
            .await?;
        items_from_rows(rows)
    }

    /// Lists every item.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn list_all(&self) -> Result<Vec<Item>, DomainError> {
        let rows = self
            .session
            .acquire()
            .await?
            .list_projections(ITEMS_PROJECTION)
            .await?;
        items_from_rows(rows)
    }

    /// Appends the item's unsaved events and upserts its projection row in
    /// the current transaction. Returns the stored version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if another writer got to
    /// the stream first, or `DomainError::Infrastructure` if storage fails.
    pub async fn save(&self, item: &Item) -> Result<i64, DomainError> {
        let base = self
            .saved_version(item.id)
            .unwrap_or_else(|| item.persisted_version());
        let records: Vec<EventRecord> = item
            .pending_events()
            .iter()
            .filter(|event| event.metadata().version > base)
            .map(DomainEvent::to_record)
            .collect();

        let state = serde_json::to_value(item.state()).map_err(|e| {
            DomainError::Infrastructure(format!("item {} could not be serialized: {e}", item.id))
        })?;

        let mut session = self.session.acquire().await?;
        let version = if records.is_empty() {
            base
        } else {
            session.append_events(item.id, base, &records).await?
        };
        session
            .upsert_projection(&ProjectionRow {
                projection: ITEMS_PROJECTION.to_owned(),
                aggregate_id: item.id,
                version,
                state,
            })
            .await?;
        drop(session);

        self.remember_saved(item.id, version);
        debug!(aggregate_id = %item.id, version, appended = records.len(), "item saved");
        Ok(version)
    }
}
