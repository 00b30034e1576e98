//! Keel API server library.
//!
//! Exposes the router, state, configuration and runtime wiring so that
//! both binaries and the integration tests build the application the same
//! way.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod telemetry;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::{AppState, Backend};

/// Builds the full application router.
pub fn build_router<F: Backend>(state: AppState<F>) -> Router {
    // TODO: Replace CorsLayer::permissive() with restricted origins for production.
    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1/items", routes::items::router())
        .nest("/api/v1/users", routes::users::router())
        .nest("/api/v1/admin", routes::admin::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
