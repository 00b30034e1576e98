//! Recording publisher: captures every batch handed over after commit.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keel_core::publisher::{EventPublisher, PublishReport};
use keel_core::repository::EventRecord;

/// An `EventPublisher` that records each `publish` call. It acknowledges
/// every event unless switched to failing mode, in which nothing is
/// delivered.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<Vec<EventRecord>>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Creates a publisher that delivers everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a publisher that records batches but delivers nothing, as if
    /// the broker were unreachable.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
        }
    }

    /// Switches failing mode on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns a snapshot of every recorded batch.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn batches(&self) -> Vec<Vec<EventRecord>> {
        self.batches.lock().unwrap().clone()
    }

    /// Returns all recorded events flattened in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<EventRecord> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, events: &[EventRecord]) -> PublishReport {
        self.batches.lock().unwrap().push(events.to_vec());
        if self.failing.load(Ordering::SeqCst) {
            PublishReport {
                delivered: Vec::new(),
                undelivered: events.len(),
            }
        } else {
            PublishReport {
                delivered: events.iter().map(|e| e.event_id).collect(),
                undelivered: 0,
            }
        }
    }
}
