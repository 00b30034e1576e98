//! Transaction-scoped sessions and the repositories bound to them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::aggregate::AggregateRoot;
use crate::error::DomainError;

/// One open database transaction.
///
/// Dropping a session without calling either method must roll it back.
#[async_trait]
pub trait Session: Send + 'static {
    /// Commits the transaction and releases the connection.
    async fn commit(self) -> Result<(), DomainError>;

    /// Rolls the transaction back and releases the connection.
    async fn rollback(self) -> Result<(), DomainError>;
}

/// Opens sessions; one per unit of work scope.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// The session type produced.
    type Session: Session;

    /// Begins a new transaction.
    async fn begin(&self) -> Result<Self::Session, DomainError>;
}

/// Shared, closable handle to the session of an active unit of work.
///
/// Repositories hold clones of the handle. Once the unit of work commits
/// or rolls back the handle is emptied and every further use fails.
pub struct SessionHandle<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

impl<S: Session> SessionHandle<S> {
    /// Wraps an open session.
    #[must_use]
    pub fn new(session: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Locks the session for one storage call.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnitOfWork` if the owning unit of work has
    /// already closed the session.
    pub async fn acquire(&self) -> Result<MappedMutexGuard<'_, S>, DomainError> {
        let guard = self.inner.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| DomainError::UnitOfWork {
            operation: "use a repository",
            state: "closed",
        })
    }

    pub(crate) async fn take(&self) -> Option<S> {
        self.inner.lock().await.take()
    }
}

/// A repository constructed on demand by the unit of work and bound to its
/// session.
///
/// Instances are cached per type for the lifetime of one scope, so `bind`
/// should be cheap and the repository cheap to clone.
pub trait Repository<S>: Clone + Send + Sync + 'static {
    /// Creates a repository that issues all its statements through
    /// `session`.
    fn bind(session: SessionHandle<S>) -> Self;
}

/// A repository that persists aggregates of type `A`.
#[async_trait]
pub trait AggregateRepository<A: AggregateRoot>: Send + Sync {
    /// Writes the aggregate's unsaved events and its read model in the
    /// current transaction. Returns the stored version.
    async fn save(&self, aggregate: &A) -> Result<i64, DomainError>;
}
