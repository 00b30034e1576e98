//! Re-publishes committed events that never reached the broker.
//!
//! The unit of work marks an event as published once the broker has
//! acknowledged it. Events left unmarked, because the post-commit publish
//! failed or the process died in between, are picked up here after a grace
//! period and sent again. Consumers may therefore see an event twice,
//! which at-least-once delivery already allows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::error::DomainError;
use keel_core::publisher::{EventPublisher, PublicationLedger};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unmarked events found.
    pub found: usize,
    /// Events delivered and marked in this sweep.
    pub republished: usize,
}

/// Periodic sweep over the publication ledger.
#[derive(Clone)]
pub struct PublicationReconciler {
    ledger: Arc<dyn PublicationLedger>,
    publisher: Arc<dyn EventPublisher>,
    grace: Duration,
    batch_size: i64,
}

impl std::fmt::Debug for PublicationReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicationReconciler")
            .field("grace", &self.grace)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl PublicationReconciler {
    /// Creates a reconciler that leaves events younger than `grace` to the
    /// request that produced them.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn PublicationLedger>,
        publisher: Arc<dyn EventPublisher>,
        grace: Duration,
    ) -> Self {
        Self {
            ledger,
            publisher,
            grace,
            batch_size: 500,
        }
    }

    /// Limits how many events one sweep picks up.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Publishes one batch of unmarked events and marks what was
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns the ledger's error if the pending events cannot be read or
    /// marked.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, DomainError> {
        let grace = chrono::Duration::from_std(self.grace)
            .map_err(|e| DomainError::Infrastructure(format!("grace period out of range: {e}")))?;
        let pending = self
            .ledger
            .unpublished_events(Utc::now() - grace, self.batch_size)
            .await?;
        if pending.is_empty() {
            return Ok(SweepReport::default());
        }

        warn!(found = pending.len(), "re-publishing events missed after commit");
        let report = self.publisher.publish(&pending).await;
        if !report.delivered.is_empty() {
            self.ledger.mark_published(&report.delivered).await?;
        }
        if !report.is_complete() {
            error!(undelivered = report.undelivered, "reconciliation left events unpublished");
        }
        Ok(SweepReport {
            found: pending.len(),
            republished: report.delivered.len(),
        })
    }

    /// Sweeps every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(?interval, "publication reconciler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "reconciliation sweep failed");
                    }
                }
            }
        }
        info!("publication reconciler stopped");
    }
}
