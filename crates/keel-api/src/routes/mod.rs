//! Route modules organized by bounded context.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use keel_core::error::DomainError;
use keel_core::unit_of_work::CommitReceipt;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;

pub mod admin;
pub mod health;
pub mod items;
pub mod users;

/// Header naming the acting user.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Response body returned after a command is successfully handled.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    /// The aggregate affected by the command.
    pub aggregate_id: Uuid,
    /// Version of the aggregate after the command.
    pub version: i64,
    /// IDs of the domain events committed.
    pub event_ids: Vec<Uuid>,
    /// Set when the events are committed but not yet on the broker.
    pub publish_pending: bool,
}

impl CommandResponse {
    pub(crate) fn new(aggregate_id: Uuid, version: i64, receipt: &CommitReceipt) -> Self {
        Self {
            aggregate_id,
            version,
            event_ids: receipt.event_ids(),
            publish_pending: !receipt.is_fully_published(),
        }
    }
}

/// The acting owner, taken from the `x-owner-id` header.
#[derive(Debug, Clone, Copy)]
pub struct OwnerId(pub Uuid);

pub(crate) fn owner_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(OWNER_HEADER)
        .ok_or_else(|| DomainError::Validation(format!("missing {OWNER_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or_else(|| ApiError(DomainError::Validation(format!("{OWNER_HEADER} must be a UUID"))))
}

impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers).map(Self)
    }
}
