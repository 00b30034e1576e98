//! Outbound mail seam.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Failure to hand a mail to the delivery service.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// The delivery service rejected or did not answer the request.
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// A welcome mail for a freshly registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeMail {
    /// Recipient user.
    pub user_id: Uuid,
    /// Recipient address.
    pub recipient: String,
    /// Name used in the greeting.
    pub username: String,
}

/// Sends transactional mail.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Sends the welcome mail.
    async fn send_welcome(&self, mail: &WelcomeMail) -> Result<(), MailError>;
}

/// Mailer that only logs what it would send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send_welcome(&self, mail: &WelcomeMail) -> Result<(), MailError> {
        info!(
            recipient = %mail.recipient,
            user_id = %mail.user_id,
            username = %mail.username,
            "sending welcome mail"
        );
        Ok(())
    }
}
