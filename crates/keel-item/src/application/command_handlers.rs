//! Command handlers for the Item context.
//!
//! Each handler owns one unit of work: it opens the transaction, mutates
//! the aggregate through [`ItemRepository`] and commits. Events are
//! published by the unit of work once the commit succeeded.

use keel_core::error::DomainError;
use keel_core::event::Clock;
use keel_core::repository::{EventStore, ProjectionStore};
use keel_core::session::SessionFactory;
use keel_core::unit_of_work::{CommandResult, UnitOfWork};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::aggregates::Item;
use crate::domain::commands::{CreateItem, DeleteItem, UpdateItem};
use crate::infrastructure::item_repository::ItemRepository;

/// Result of a successfully handled item command.
pub type ItemCommandResult = CommandResult;

async fn create_in_scope<F>(
    command: &CreateItem,
    clock: &dyn Clock,
    uow: &mut UnitOfWork<F>,
) -> Result<(Uuid, i64), DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo: ItemRepository<F::Session> = uow.get_repository()?;
    let item = Item::create(
        command.owner_id,
        &command.name,
        command.description.clone(),
        command.correlation_id,
        clock,
    )?;
    uow.add(&repo, item).await
}

async fn modify_in_scope<F, M>(
    uow: &mut UnitOfWork<F>,
    item_id: Uuid,
    owner_id: Uuid,
    mutate: M,
) -> Result<(Uuid, i64), DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
    M: FnOnce(&mut Item) -> Result<(), DomainError> + Send,
{
    let repo: ItemRepository<F::Session> = uow.get_repository()?;
    let item = repo
        .get(item_id, owner_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(item_id))?;
    uow.modify(&repo, item, mutate).await
}

/// Handles the `CreateItem` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an invalid name, or the storage
/// error if the transaction fails. Nothing is published on error.
#[instrument(skip_all, fields(owner_id = %command.owner_id, correlation_id = %command.correlation_id))]
pub async fn handle_create_item<F>(
    command: &CreateItem,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<ItemCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = create_in_scope(command, clock, &mut uow).await;
    uow.complete(outcome).await
}

/// Handles the `UpdateItem` command: renames and/or re-describes an item
/// of the acting owner. Unchanged values produce no event.
///
/// # Errors
///
/// Returns `DomainError::Validation` when neither field is given,
/// `DomainError::AggregateNotFound` if the owner has no such item,
/// `DomainError::BusinessRule` if it is deleted, and
/// `DomainError::ConcurrencyConflict` if a concurrent writer committed
/// first.
#[instrument(skip_all, fields(item_id = %command.item_id, correlation_id = %command.correlation_id))]
pub async fn handle_update_item<F>(
    command: &UpdateItem,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<ItemCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    if command.name.is_none() && command.description.is_none() {
        return Err(DomainError::Validation(
            "update must change the name or the description".into(),
        ));
    }
    uow.enter().await?;
    let outcome = modify_in_scope(&mut uow, command.item_id, command.owner_id, |item| {
        if let Some(name) = &command.name {
            item.rename(name, command.correlation_id, clock)?;
        }
        if let Some(description) = &command.description {
            item.update_description(Some(description.clone()), command.correlation_id, clock)?;
        }
        Ok(())
    })
    .await;
    uow.complete(outcome).await
}

/// Handles the `DeleteItem` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the owner has no such item
/// and `DomainError::BusinessRule` if it is already deleted.
#[instrument(skip_all, fields(item_id = %command.item_id, correlation_id = %command.correlation_id))]
pub async fn handle_delete_item<F>(
    command: &DeleteItem,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<ItemCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = modify_in_scope(&mut uow, command.item_id, command.owner_id, |item| {
        item.delete(command.correlation_id, clock)
    })
    .await;
    uow.complete(outcome).await
}
