//! Command handlers for the IAM context.

use keel_core::error::DomainError;
use keel_core::event::Clock;
use keel_core::repository::{EventStore, ProjectionStore};
use keel_core::session::SessionFactory;
use keel_core::unit_of_work::{CommandResult, UnitOfWork};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::aggregates::User;
use crate::domain::commands::{ActivateUser, DeactivateUser, RegisterUser, UpdateProfile};
use crate::infrastructure::user_repository::UserRepository;

/// Result of a successfully handled user command.
pub type UserCommandResult = CommandResult;

async fn register_in_scope<F>(
    command: &RegisterUser,
    clock: &dyn Clock,
    uow: &mut UnitOfWork<F>,
) -> Result<(Uuid, i64), DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    let repo: UserRepository<F::Session> = uow.get_repository()?;
    let user = User::register(
        &command.username,
        &command.email,
        command.correlation_id,
        clock,
    )?;
    if repo.find_by_username(user.username()).await?.is_some() {
        return Err(DomainError::BusinessRule(format!(
            "username '{}' already exists",
            user.username()
        )));
    }
    if repo.find_by_email(user.email()).await?.is_some() {
        return Err(DomainError::BusinessRule(format!(
            "email '{}' is already registered",
            user.email()
        )));
    }
    uow.add(&repo, user).await
}

async fn modify_in_scope<F, M>(
    uow: &mut UnitOfWork<F>,
    user_id: Uuid,
    mutate: M,
) -> Result<(Uuid, i64), DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
    M: FnOnce(&mut User) -> Result<(), DomainError> + Send,
{
    let repo: UserRepository<F::Session> = uow.get_repository()?;
    let user = repo
        .get(user_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(user_id))?;
    uow.modify(&repo, user, mutate).await
}

/// Handles the `RegisterUser` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for malformed input and
/// `DomainError::BusinessRule` if the username or email is taken.
#[instrument(skip_all, fields(username = %command.username, correlation_id = %command.correlation_id))]
pub async fn handle_register_user<F>(
    command: &RegisterUser,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<UserCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = register_in_scope(command, clock, &mut uow).await;
    uow.complete(outcome).await
}

/// Handles the `DeactivateUser` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown user and
/// `DomainError::BusinessRule` if the user is already inactive.
#[instrument(skip_all, fields(user_id = %command.user_id, correlation_id = %command.correlation_id))]
pub async fn handle_deactivate_user<F>(
    command: &DeactivateUser,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<UserCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = modify_in_scope(&mut uow, command.user_id, |user| {
        user.deactivate(command.correlation_id, clock)
    })
    .await;
    uow.complete(outcome).await
}

/// Handles the `ActivateUser` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown user and
/// `DomainError::BusinessRule` if the user is already active.
#[instrument(skip_all, fields(user_id = %command.user_id, correlation_id = %command.correlation_id))]
pub async fn handle_activate_user<F>(
    command: &ActivateUser,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<UserCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = modify_in_scope(&mut uow, command.user_id, |user| {
        user.activate(command.correlation_id, clock)
    })
    .await;
    uow.complete(outcome).await
}

/// Handles the `UpdateProfile` command. A no-op update commits without
/// events.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown user,
/// `DomainError::Validation` for a malformed email and
/// `DomainError::BusinessRule` if the new email belongs to another user.
#[instrument(skip_all, fields(user_id = %command.user_id, correlation_id = %command.correlation_id))]
pub async fn handle_update_profile<F>(
    command: &UpdateProfile,
    clock: &dyn Clock,
    mut uow: UnitOfWork<F>,
) -> Result<UserCommandResult, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let outcome = update_profile_in_scope(command, clock, &mut uow).await;
    uow.complete(outcome).await
}

async fn update_profile_in_scope<F>(
    command: &UpdateProfile,
    clock: &dyn Clock,
    uow: &mut UnitOfWork<F>,
) -> Result<(Uuid, i64), DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    if let Some(email) = &command.email {
        let repo: UserRepository<F::Session> = uow.get_repository()?;
        let taken = repo
            .find_by_email(email.trim())
            .await?
            .is_some_and(|holder| holder.id != command.user_id);
        if taken {
            return Err(DomainError::BusinessRule(format!(
                "email '{}' is already registered",
                email.trim()
            )));
        }
    }
    modify_in_scope(uow, command.user_id, |user| {
        user.update_profile(
            command.email.as_deref(),
            command.profile_picture_url.as_deref(),
            command.correlation_id,
            clock,
        )
        .map(|_| ())
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_test_support::{FixedClock, InMemoryDatabase, RecordingPublisher};

    use super::*;

    struct Harness {
        db: Arc<InMemoryDatabase>,
        publisher: Arc<RecordingPublisher>,
        clock: FixedClock,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                db: Arc::new(InMemoryDatabase::new()),
                publisher: Arc::new(RecordingPublisher::new()),
                clock: FixedClock::standard(),
            }
        }

        fn uow(&self) -> UnitOfWork<InMemoryDatabase> {
            UnitOfWork::new(Arc::clone(&self.db), self.publisher.clone())
        }

        async fn register(&self, username: &str, email: &str) -> Result<UserCommandResult, DomainError> {
            let command = RegisterUser {
                correlation_id: Uuid::new_v4(),
                username: username.into(),
                email: email.into(),
            };
            handle_register_user(&command, &self.clock, self.uow()).await
        }
    }

    #[tokio::test]
    async fn test_handle_register_user_publishes_user_registered() {
        // Arrange
        let h = Harness::new();

        // Act
        let result = h.register("ada", "ada@example.com").await.unwrap();

        // Assert
        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_kind, "user.registered");
        assert_eq!(published[0].payload["email"], "ada@example.com");
        let row = h.db.projection("users", result.aggregate_id).unwrap();
        assert_eq!(row.state["is_active"], true);
        assert_eq!(row.state["username"], "ada");
    }

    #[tokio::test]
    async fn test_handle_register_user_rejects_taken_username() {
        let h = Harness::new();
        h.register("ada", "ada@example.com").await.unwrap();

        let result = h.register(" ada ", "lovelace@example.com").await;

        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
        assert_eq!(h.db.snapshot().events.len(), 1);
        assert_eq!(h.publisher.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_register_user_rejects_taken_email() {
        let h = Harness::new();
        h.register("ada", "ada@example.com").await.unwrap();

        let result = h.register("lovelace", "ada@example.com").await;

        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn test_deactivate_then_activate_round_trip() {
        let h = Harness::new();
        let user_id = h.register("ada", "ada@example.com").await.unwrap().aggregate_id;
        let deactivate = DeactivateUser {
            correlation_id: Uuid::new_v4(),
            user_id,
        };
        let activate = ActivateUser {
            correlation_id: Uuid::new_v4(),
            user_id,
        };

        handle_deactivate_user(&deactivate, &h.clock, h.uow()).await.unwrap();
        let again = handle_deactivate_user(&deactivate, &h.clock, h.uow()).await;
        let result = handle_activate_user(&activate, &h.clock, h.uow()).await.unwrap();

        assert!(matches!(again, Err(DomainError::BusinessRule(_))));
        assert_eq!(result.version, 3);
        let kinds: Vec<String> = h
            .publisher
            .published()
            .into_iter()
            .map(|e| e.event_kind)
            .collect();
        assert_eq!(kinds, vec!["user.registered", "user.deactivated", "user.activated"]);
    }

    #[tokio::test]
    async fn test_handle_update_profile_rejects_email_of_another_user() {
        let h = Harness::new();
        h.register("ada", "ada@example.com").await.unwrap();
        let grace = h.register("grace", "grace@example.com").await.unwrap();
        let command = UpdateProfile {
            correlation_id: Uuid::new_v4(),
            user_id: grace.aggregate_id,
            email: Some("ada@example.com".into()),
            profile_picture_url: None,
        };

        let result = handle_update_profile(&command, &h.clock, h.uow()).await;

        assert!(matches!(result, Err(DomainError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn test_handle_update_profile_for_unknown_user_is_not_found() {
        let h = Harness::new();
        let command = UpdateProfile {
            correlation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            email: None,
            profile_picture_url: Some("https://cdn.example.com/x.png".into()),
        };

        let result = handle_update_profile(&command, &h.clock, h.uow()).await;

        assert!(matches!(result, Err(DomainError::AggregateNotFound(_))));
        assert_eq!(h.db.rollbacks(), 1);
    }
}
