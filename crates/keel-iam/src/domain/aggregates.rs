//! Aggregate roots for the IAM context.

use keel_core::aggregate::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::{Clock, EventMetadata, EventPayload};
use keel_core::repository::EventRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    UserActivated, UserDeactivated, UserEvent, UserEventKind, UserProfileUpdated, UserRegistered,
};

/// Longest accepted username, in characters.
pub const MAX_USERNAME_LEN: usize = 50;
/// Longest accepted email address, in characters.
pub const MAX_EMAIL_LEN: usize = 100;

/// Current field values of a user, as stored in the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    /// Unique login name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Avatar URL.
    pub profile_picture_url: Option<String>,
    /// Whether the user may sign in.
    pub is_active: bool,
    /// Whether the user has administrative rights.
    pub is_superuser: bool,
}

/// The aggregate root for a user account.
#[derive(Debug)]
pub struct User {
    /// Aggregate identifier.
    pub id: Uuid,
    version: i64,
    state: UserState,
    pending_events: Vec<UserEvent>,
}

fn validate_username(username: &str) -> Result<String, DomainError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(DomainError::Validation("username must not be blank".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(DomainError::Validation(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(username.to_owned())
}

fn validate_email(email: &str) -> Result<String, DomainError> {
    let email = email.trim();
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.contains('@')
        });
    if !well_formed {
        return Err(DomainError::Validation(format!(
            "'{email}' is not a valid email address"
        )));
    }
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(DomainError::Validation(format!(
            "email must be at most {MAX_EMAIL_LEN} characters"
        )));
    }
    Ok(email.to_owned())
}

impl User {
    fn blank(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: UserState {
                username: String::new(),
                email: String::new(),
                profile_picture_url: None,
                is_active: true,
                is_superuser: false,
            },
            pending_events: Vec::new(),
        }
    }

    /// Registers a new, active user, producing a `UserRegistered` event.
    ///
    /// Uniqueness of username and email is checked by the command handler
    /// against the projection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a blank or over-long username
    /// or a malformed email address.
    pub fn register(
        username: &str,
        email: &str,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<Self, DomainError> {
        let username = validate_username(username)?;
        let email = validate_email(email)?;
        let mut user = Self::blank(Uuid::now_v7());
        user.record(
            UserEventKind::Registered(UserRegistered {
                user_id: user.id,
                username,
                email,
            }),
            correlation_id,
            clock,
        );
        Ok(user)
    }

    /// Rebuilds a user from its stored history.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` for an empty history and
    /// `DomainError::Infrastructure` for an unreadable event.
    pub fn reconstitute(id: Uuid, history: &[EventRecord]) -> Result<Self, DomainError> {
        if history.is_empty() {
            return Err(DomainError::AggregateNotFound(id));
        }
        let mut user = Self::blank(id);
        for record in history {
            user.replay(&UserEvent::from_record(record)?);
        }
        Ok(user)
    }

    /// Rebuilds a user from its projection row.
    #[must_use]
    pub fn from_state(id: Uuid, version: i64, state: UserState) -> Self {
        Self {
            id,
            version,
            state,
            pending_events: Vec::new(),
        }
    }

    /// Current field values.
    #[must_use]
    pub fn state(&self) -> &UserState {
        &self.state
    }

    /// Unique login name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.state.username
    }

    /// Contact address.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.state.email
    }

    /// Whether the user may sign in.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active
    }

    fn record(&mut self, kind: UserEventKind, correlation_id: Uuid, clock: &dyn Clock) {
        let event_kind = match &kind {
            UserEventKind::Registered(_) => UserRegistered::EVENT_KIND,
            UserEventKind::Deactivated(_) => UserDeactivated::EVENT_KIND,
            UserEventKind::Activated(_) => UserActivated::EVENT_KIND,
            UserEventKind::ProfileUpdated(_) => UserProfileUpdated::EVENT_KIND,
        };
        let metadata = EventMetadata::new(
            event_kind,
            self.id,
            self.next_version(),
            correlation_id,
            clock,
        );
        self.apply(UserEvent { metadata, kind });
    }

    /// Deactivates the user.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::BusinessRule` if the user is already inactive.
    pub fn deactivate(&mut self, correlation_id: Uuid, clock: &dyn Clock) -> Result<(), DomainError> {
        if !self.state.is_active {
            return Err(DomainError::BusinessRule("user is already inactive".into()));
        }
        self.record(
            UserEventKind::Deactivated(UserDeactivated { user_id: self.id }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Activates the user.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::BusinessRule` if the user is already active.
    pub fn activate(&mut self, correlation_id: Uuid, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.state.is_active {
            return Err(DomainError::BusinessRule("user is already active".into()));
        }
        self.record(
            UserEventKind::Activated(UserActivated { user_id: self.id }),
            correlation_id,
            clock,
        );
        Ok(())
    }

    /// Changes the email and/or avatar URL. Returns `true` if an event was
    /// recorded, `false` if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a malformed email address.
    pub fn update_profile(
        &mut self,
        email: Option<&str>,
        profile_picture_url: Option<&str>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<bool, DomainError> {
        let email = match email {
            Some(email) => validate_email(email)?,
            None => self.state.email.clone(),
        };
        let profile_picture_url = match profile_picture_url {
            Some(url) => Some(url.trim().to_owned()).filter(|url| !url.is_empty()),
            None => self.state.profile_picture_url.clone(),
        };
        if email == self.state.email && profile_picture_url == self.state.profile_picture_url {
            return Ok(false);
        }
        self.record(
            UserEventKind::ProfileUpdated(UserProfileUpdated {
                user_id: self.id,
                email,
                profile_picture_url,
            }),
            correlation_id,
            clock,
        );
        Ok(true)
    }
}

impl AggregateRoot for User {
    type Event = UserEvent;

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn replay(&mut self, event: &UserEvent) {
        match &event.kind {
            UserEventKind::Registered(payload) => {
                self.state.username.clone_from(&payload.username);
                self.state.email.clone_from(&payload.email);
                self.state.is_active = true;
            }
            UserEventKind::Deactivated(_) => self.state.is_active = false,
            UserEventKind::Activated(_) => self.state.is_active = true,
            UserEventKind::ProfileUpdated(payload) => {
                self.state.email.clone_from(&payload.email);
                self.state
                    .profile_picture_url
                    .clone_from(&payload.profile_picture_url);
            }
        }
        self.version += 1;
    }

    fn pending_events(&self) -> &[UserEvent] {
        &self.pending_events
    }

    fn pending_events_mut(&mut self) -> &mut Vec<UserEvent> {
        &mut self.pending_events
    }
}
