//! Broker-side handlers for IAM events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_broker::error::BrokerError;
use keel_broker::message::EventMessage;
use keel_broker::registry::{EventHandler, HandlerRegistry};
use keel_core::error::DomainError;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::events::UserRegistered;
use crate::infrastructure::mailer::{Mailer, WelcomeMail};

/// Sends a welcome mail for every `user.registered` event.
///
/// Remembers the events it has mailed for, so a redelivered message does
/// not mail twice within one process.
pub struct WelcomeMailHandler {
    mailer: Arc<dyn Mailer>,
    sent: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for WelcomeMailHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WelcomeMailHandler").finish_non_exhaustive()
    }
}

impl WelcomeMailHandler {
    /// Creates a handler sending through `mailer`.
    #[must_use]
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer,
            sent: Mutex::new(HashSet::new()),
        }
    }

    fn already_sent(&self, event_id: Uuid) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&event_id)
    }

    fn mark_sent(&self, event_id: Uuid) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id);
    }
}

#[async_trait]
impl EventHandler<UserRegistered> for WelcomeMailHandler {
    fn name(&self) -> &'static str {
        "welcome_mail"
    }

    async fn handle(&self, message: &EventMessage<UserRegistered>) -> Result<(), DomainError> {
        if self.already_sent(message.event_id) {
            debug!(event_id = %message.event_id, "welcome mail already sent");
            return Ok(());
        }
        let mail = WelcomeMail {
            user_id: message.payload.user_id,
            recipient: message.payload.email.clone(),
            username: message.payload.username.clone(),
        };
        self.mailer
            .send_welcome(&mail)
            .await
            .map_err(|e| DomainError::Infrastructure(e.to_string()))?;
        self.mark_sent(message.event_id);
        info!(event_id = %message.event_id, user_id = %mail.user_id, "welcome mail sent");
        Ok(())
    }
}

/// Subscribes every IAM handler to `registry`.
///
/// # Errors
///
/// Returns `BrokerError::KindConflict` if an IAM kind is already bound to
/// another payload type.
pub fn register_handlers(
    registry: &mut HandlerRegistry,
    mailer: Arc<dyn Mailer>,
) -> Result<(), BrokerError> {
    registry.subscribe::<UserRegistered, _>(Arc::new(WelcomeMailHandler::new(mailer)))
}
