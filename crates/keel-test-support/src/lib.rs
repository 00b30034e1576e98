//! Shared test doubles and utilities for the Keel backend.

mod clock;
mod database;
mod publisher;

pub use clock::FixedClock;
pub use database::{DatabaseSnapshot, InMemoryDatabase, InMemorySession};
pub use publisher::RecordingPublisher;
