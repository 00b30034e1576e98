//! Administrative read routes, unscoped by owner.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use keel_iam::application::query_handlers::{self as user_queries, UserView};
use keel_item::application::query_handlers::{self as item_queries, ItemView};

use crate::error::ApiError;
use crate::state::{AppState, Backend};

/// GET /items
async fn list_all_items<F: Backend>(
    State(state): State<AppState<F>>,
) -> Result<Json<Vec<ItemView>>, ApiError> {
    Ok(Json(item_queries::list_all_items(state.unit_of_work()).await?))
}

/// GET /items/{id}
async fn get_any_item<F: Backend>(
    State(state): State<AppState<F>>,
    Path(item_id): Path<Uuid>,
) -> Result<Json<ItemView>, ApiError> {
    Ok(Json(
        item_queries::get_item_by_id_admin(item_id, state.unit_of_work()).await?,
    ))
}

/// GET /users
async fn list_users<F: Backend>(
    State(state): State<AppState<F>>,
) -> Result<Json<Vec<UserView>>, ApiError> {
    Ok(Json(user_queries::list_users(state.unit_of_work()).await?))
}

/// Returns the administrative router.
pub fn router<F: Backend>() -> Router<AppState<F>> {
    Router::new()
        .route("/items", get(list_all_items::<F>))
        .route("/items/{id}", get(get_any_item::<F>))
        .route("/users", get(list_users::<F>))
}
