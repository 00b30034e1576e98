//! User persistence: event stream plus the `users` projection.

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

use crate::domain::aggregates::{User, UserState};

/// Projection name of the user read model.
pub const USERS_PROJECTION: &str = "users";

/// Repository for [`User`] aggregates, bound to one unit of work.
pub struct UserRepository<S> {
    session: SessionHandle<S>,
    saved: Arc<Mutex<HashMap<Uuid, i64>>>,
}

impl<S> Clone for UserRepository<S> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            saved: Arc::clone(&self.saved),
        }
    }
}

impl<S> std::fmt::Debug for UserRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRepository").finish_non_exhaustive()
    }
}

impl<S> Repository<S> for UserRepository<S>
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

fn user_from_row(row: ProjectionRow) -> Result<User, DomainError> {
    let state: UserState = serde_json::from_value(row.state).map_err(|e| {
        DomainError::Infrastructure(format!(
            "users projection row {} could not be read: {e}",
            row.aggregate_id
        ))
    })?;
    Ok(User::from_state(row.aggregate_id, row.version, state))
}

#[async_trait]
impl<S> AggregateRepository<User> for UserRepository<S>
where
    S: Session + EventStore + ProjectionStore,
{
    async fn save(&self, aggregate: &User) -> Result<i64, DomainError> {
        UserRepository::save(self, aggregate).await
    }
}

impl<S> UserRepository<S>
where
    S: Session + EventStore + ProjectionStore,
{
    /// Fetches a user from the projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn get(&self, user_id: Uuid) -> Result<Option<User>, DomainError> {
        let row = self
            .session
            .acquire()
            .await?
            .fetch_projection(USERS_PROJECTION, user_id)
            .await?;
        row.map(user_from_row).transpose()
    }

    /// Rebuilds a user from its event stream.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if the stream is empty.
    pub async fn load(&self, user_id: Uuid) -> Result<User, DomainError> {
        let history = self.session.acquire().await?.load_events(user_id).await?;
        User::reconstitute(user_id, &history)
    }

    async fn find_one(&self, field: &str, value: &str) -> Result<Option<User>, DomainError> {
        let rows = self
            .session
            .acquire()
            .await?
            .find_projections(USERS_PROJECTION, field, value)
            .await?;
        rows.into_iter().next().map(user_from_row).transpose()
    }

    /// Finds the user holding `username`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, DomainError> {
        self.find_one("username", username).await
    }

    /// Finds the user holding `email`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, DomainError> {
        self.find_one("email", email).await
    }

    /// Lists every user.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if storage fails.
    pub async fn list_all(&self) -> Result<Vec<User>, DomainError> {
        let rows = self
            .session
            .acquire()
            .await?
            .list_projections(USERS_PROJECTION)
            .await?;
        rows.into_iter().map(user_from_row).collect()
    }

    /// Appends the user's unsaved events and upserts its projection row.
    /// Returns the stored version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if another writer got to
    /// the stream first.
    pub async fn save(&self, user: &User) -> Result<i64, DomainError> {
        let base = self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user.id)
            .copied()
            .unwrap_or_else(|| user.persisted_version());
        let records: Vec<EventRecord> = user
            .pending_events()
            .iter()
            .filter(|event| event.metadata().version > base)
            .map(DomainEvent::to_record)
            .collect();
        let state = serde_json::to_value(user.state()).map_err(|e| {
            DomainError::Infrastructure(format!("user {} could not be serialized: {e}", user.id))
        })?;

        let mut session = self.session.acquire().await?;
        let version = if records.is_empty() {
            base
        } else {
            session.append_events(user.id, base, &records).await?
        };
        session
            .upsert_projection(&ProjectionRow {
                projection: USERS_PROJECTION.to_owned(),
                aggregate_id: user.id,
                version,
                state,
            })
            .await?;
        drop(session);

        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id, version);
        debug!(aggregate_id = %user.id, version, appended = records.len(), "user saved");
        Ok(version)
    }
}
