//! Commands for the IAM context.

use uuid::Uuid;

/// Command to register a new user.
#[derive(Debug, Clone)]
pub struct RegisterUser {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Requested login name.
    pub username: String,
    /// Contact address.
    pub email: String,
}

/// Command to deactivate a user.
#[derive(Debug, Clone)]
pub struct DeactivateUser {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The user identifier.
    pub user_id: Uuid,
}

/// Command to activate a deactivated user.
#[derive(Debug, Clone)]
pub struct ActivateUser {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The user identifier.
    pub user_id: Uuid,
}

/// Command to change profile fields. Fields left as `None` are kept.
#[derive(Debug, Clone)]
pub struct UpdateProfile {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The user identifier.
    pub user_id: Uuid,
    /// New contact address.
    pub email: Option<String>,
    /// New avatar URL.
    pub profile_picture_url: Option<String>,
}
