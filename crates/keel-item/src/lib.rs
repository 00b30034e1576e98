//! Keel: Item bounded context.
//!
//! Items are event sourced: the event store holds their history and the
//! `items` projection their current state. Both are written by
//! [`infrastructure::item_repository::ItemRepository::save`] inside the
//! caller's unit of work.

pub mod domain {
    pub mod aggregates;
    pub mod commands;
    pub mod events;
}

pub mod application {
    pub mod command_handlers;
    pub mod query_handlers;
}

pub mod infrastructure {
    pub mod item_repository;
}
