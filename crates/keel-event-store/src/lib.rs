//! PostgreSQL storage for the Keel backend.
//!
//! A [`PgSession`] wraps one `sqlx` transaction and serves as both the
//! event store and the projection store for the unit of work that opened
//! it. [`PgPublicationLedger`] works against the pool directly.

pub mod pg_publication_ledger;
pub mod pg_session;
pub mod schema;

pub use pg_publication_ledger::PgPublicationLedger;
pub use pg_session::{PgSession, PgSessionFactory};
