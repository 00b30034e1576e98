//! Commands for the Item context.

use uuid::Uuid;

/// Command to create an item.
#[derive(Debug, Clone)]
pub struct CreateItem {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The owning user.
    pub owner_id: Uuid,
    /// Item name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
}

/// Command to change an item's name and/or description.
///
/// Fields left as `None` are not touched.
#[derive(Debug, Clone)]
pub struct UpdateItem {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The item identifier.
    pub item_id: Uuid,
    /// The acting owner.
    pub owner_id: Uuid,
    /// New name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
}

/// Command to delete an item.
#[derive(Debug, Clone)]
pub struct DeleteItem {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The item identifier.
    pub item_id: Uuid,
    /// The acting owner.
    pub owner_id: Uuid,
}
