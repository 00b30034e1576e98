//! Keel: Identity and access bounded context.
//!
//! Users are event sourced like items and materialized in the `users`
//! projection. Registration publishes `user.registered`, which the
//! [`application::event_handlers::WelcomeMailHandler`] consumes from the
//! broker.

pub mod domain {
    pub mod aggregates;
    pub mod commands;
    pub mod events;
}

pub mod application {
    pub mod command_handlers;
    pub mod event_handlers;
    pub mod query_handlers;
}

pub mod infrastructure {
    pub mod mailer;
    pub mod user_repository;
}
