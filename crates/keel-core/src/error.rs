//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type shared by aggregates, repositories and the unit of
/// work.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict on the event store.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The version the writer expected to extend.
        expected: i64,
        /// The highest version actually stored.
        actual: i64,
    },

    /// Malformed input rejected before reaching an aggregate.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation is not allowed in the aggregate's current state.
    #[error("business rule violation: {0}")]
    BusinessRule(String),

    /// A unit of work method was called outside its active window.
    ///
    /// This is a programming error and is never retried.
    #[error("unit of work is {state}; cannot {operation}")]
    UnitOfWork {
        /// The operation that was attempted.
        operation: &'static str,
        /// The lifecycle state the unit of work was in.
        state: &'static str,
    },

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` if this is an optimistic concurrency conflict.
    #[must_use]
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
