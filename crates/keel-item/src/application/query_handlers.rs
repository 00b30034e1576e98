//! Query handlers for the Item context.
//!
//! Queries read the `items` projection inside their own unit of work and
//! return read-only view DTOs. They never record events.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::repository::{EventStore, ProjectionStore};
use keel_core::session::SessionFactory;
use keel_core::unit_of_work::UnitOfWork;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::Item;
use crate::infrastructure::item_repository::ItemRepository;

/// Read-only view of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemView {
    /// The item identifier.
    pub item_id: Uuid,
    /// The owning user.
    pub owner_id: Uuid,
    /// Item name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Whether the item has been deleted.
    pub is_deleted: bool,
    /// Current version (event count).
    pub version: i64,
}

impl From<&Item> for ItemView {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.id,
            owner_id: item.owner_id(),
            name: item.name().to_owned(),
            description: item.description().map(str::to_owned),
            is_deleted: item.is_deleted(),
            version: item.version(),
        }
    }
}

async fn open<F>(uow: &mut UnitOfWork<F>) -> Result<ItemRepository<F::Session>, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    uow.get_repository()
}

async fn close<F, T>(
    mut uow: UnitOfWork<F>,
    outcome: Result<T, DomainError>,
) -> Result<T, DomainError>
where
    F: SessionFactory,
{
    let (value, _) = uow.finish(outcome).await?;
    Ok(value)
}

fn live_views(items: &[Item]) -> Vec<ItemView> {
    items
        .iter()
        .filter(|item| !item.is_deleted())
        .map(ItemView::from)
        .collect()
}

/// Retrieves a live item of `owner_id`.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the item does not exist,
/// belongs to another owner, or is deleted.
pub async fn get_item_by_id<F>(
    item_id: Uuid,
    owner_id: Uuid,
    mut uow: UnitOfWork<F>,
) -> Result<ItemView, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo = open(&mut uow).await?;
    let outcome: Result<_, DomainError> = async {
        repo.get(item_id, owner_id)
            .await?
            .filter(|item| !item.is_deleted())
            .map(|item| ItemView::from(&item))
            .ok_or(DomainError::AggregateNotFound(item_id))
    }
    .await;
    close(uow, outcome).await
}

/// Lists the live items of `owner_id`.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if storage fails.
pub async fn list_items_by_owner<F>(
    owner_id: Uuid,
    mut uow: UnitOfWork<F>,
) -> Result<Vec<ItemView>, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo = open(&mut uow).await?;
    let outcome = repo
        .list_by_owner(owner_id)
        .await
        .map(|items| live_views(&items));
    close(uow, outcome).await
}

/// Retrieves any item, deleted ones included. Administrative access.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the item does not exist.
pub async fn get_item_by_id_admin<F>(
    item_id: Uuid,
    mut uow: UnitOfWork<F>,
) -> Result<ItemView, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo = open(&mut uow).await?;
    let outcome: Result<_, DomainError> = async {
        repo.get_any(item_id)
            .await?
            .map(|item| ItemView::from(&item))
            .ok_or(DomainError::AggregateNotFound(item_id))
    }
    .await;
    close(uow, outcome).await
}

/// Lists every item, deleted ones included. Administrative access.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if storage fails.
pub async fn list_all_items<F>(mut uow: UnitOfWork<F>) -> Result<Vec<ItemView>, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo = open(&mut uow).await?;
    let outcome = repo
        .list_all()
        .await
        .map(|items| items.iter().map(ItemView::from).collect());
    close(uow, outcome).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_test_support::{FixedClock, InMemoryDatabase, RecordingPublisher};

    use super::*;
    use crate::application::command_handlers::{handle_create_item, handle_delete_item};
    use crate::domain::commands::{CreateItem, DeleteItem};

    struct Fixture {
        db: Arc<InMemoryDatabase>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(InMemoryDatabase::new()),
                publisher: Arc::new(RecordingPublisher::new()),
            }
        }

        fn uow(&self) -> UnitOfWork<InMemoryDatabase> {
            UnitOfWork::new(Arc::clone(&self.db), self.publisher.clone())
        }

        async fn create(&self, owner_id: Uuid, name: &str) -> Uuid {
            let command = CreateItem {
                correlation_id: Uuid::new_v4(),
                owner_id,
                name: name.into(),
                description: Some("note".into()),
            };
            handle_create_item(&command, &FixedClock::standard(), self.uow())
                .await
                .unwrap()
                .aggregate_id
        }

        async fn delete(&self, owner_id: Uuid, item_id: Uuid) {
            let command = DeleteItem {
                correlation_id: Uuid::new_v4(),
                item_id,
                owner_id,
            };
            handle_delete_item(&command, &FixedClock::standard(), self.uow())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_item_by_id_returns_owner_view() {
        // Arrange
        let fx = Fixture::new();
        let owner_id = Uuid::new_v4();
        let item_id = fx.create(owner_id, "Lamp").await;

        // Act
        let view = get_item_by_id(item_id, owner_id, fx.uow()).await.unwrap();

        // Assert
        assert_eq!(
            view,
            ItemView {
                item_id,
                owner_id,
                name: "Lamp".into(),
                description: Some("note".into()),
                is_deleted: false,
                version: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_get_item_by_id_hides_other_owners_and_deleted_items() {
        let fx = Fixture::new();
        let owner_id = Uuid::new_v4();
        let item_id = fx.create(owner_id, "Lamp").await;

        let foreign = get_item_by_id(item_id, Uuid::new_v4(), fx.uow()).await;
        fx.delete(owner_id, item_id).await;
        let deleted = get_item_by_id(item_id, owner_id, fx.uow()).await;
        let admin = get_item_by_id_admin(item_id, fx.uow()).await.unwrap();

        assert!(matches!(foreign, Err(DomainError::AggregateNotFound(_))));
        assert!(matches!(deleted, Err(DomainError::AggregateNotFound(_))));
        assert!(admin.is_deleted);
        assert_eq!(admin.version, 2);
    }

    #[tokio::test]
    async fn test_list_items_by_owner_excludes_deleted_but_admin_list_does_not() {
        let fx = Fixture::new();
        let owner_id = Uuid::new_v4();
        let kept = fx.create(owner_id, "Lamp").await;
        let removed = fx.create(owner_id, "Chair").await;
        let foreign = fx.create(Uuid::new_v4(), "Desk").await;
        fx.delete(owner_id, removed).await;

        let mine = list_items_by_owner(owner_id, fx.uow()).await.unwrap();
        let all = list_all_items(fx.uow()).await.unwrap();

        let mine: Vec<Uuid> = mine.iter().map(|v| v.item_id).collect();
        assert_eq!(mine, vec![kept]);
        let mut all: Vec<Uuid> = all.iter().map(|v| v.item_id).collect();
        all.sort();
        let mut expected = vec![kept, removed, foreign];
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_get_item_by_id_admin_unknown_is_not_found() {
        let fx = Fixture::new();
        let missing = Uuid::new_v4();

        let result = get_item_by_id_admin(missing, fx.uow()).await;

        assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == missing));
    }
}
