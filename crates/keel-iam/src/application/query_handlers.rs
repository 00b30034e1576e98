//! Query handlers for the IAM context.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::repository::{EventStore, ProjectionStore};
use keel_core::session::SessionFactory;
use keel_core::unit_of_work::UnitOfWork;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::User;
use crate::infrastructure::user_repository::UserRepository;

/// Read-only view of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    /// The user identifier.
    pub user_id: Uuid,
    /// Unique login name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Avatar URL.
    pub profile_picture_url: Option<String>,
    /// Whether the user may sign in.
    pub is_active: bool,
    /// Whether the user has administrative rights.
    pub is_superuser: bool,
    /// Current version (event count).
    pub version: i64,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        let state = user.state();
        Self {
            user_id: user.id,
            username: state.username.clone(),
            email: state.email.clone(),
            profile_picture_url: state.profile_picture_url.clone(),
            is_active: state.is_active,
            is_superuser: state.is_superuser,
            version: user.version(),
        }
    }
}

/// Retrieves a user by ID.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the user does not exist.
pub async fn get_user_by_id<F>(user_id: Uuid, mut uow: UnitOfWork<F>) -> Result<UserView, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let repo: UserRepository<F::Session> = uow.get_repository()?;
    let outcome = repo.get(user_id).await.and_then(|found| {
        found
            .map(|user| UserView::from(&user))
            .ok_or(DomainError::AggregateNotFound(user_id))
    });
    let (view, _) = uow.finish(outcome).await?;
    Ok(view)
}

/// Lists every user, ordered by ID.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if storage fails.
pub async fn list_users<F>(mut uow: UnitOfWork<F>) -> Result<Vec<UserView>, DomainError>
where
    F: SessionFactory,
    F::Session: EventStore + ProjectionStore,
{
    uow.enter().await?;
    let repo: UserRepository<F::Session> = uow.get_repository()?;
    let outcome = repo
        .list_all()
        .await
        .map(|users| users.iter().map(UserView::from).collect());
    let (views, _) = uow.finish(outcome).await?;
    Ok(views)
}
