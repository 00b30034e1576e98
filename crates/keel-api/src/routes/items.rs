//! Routes for the Item bounded context.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use keel_item::application::query_handlers::ItemView;
use keel_item::application::{command_handlers, query_handlers};
use keel_item::domain::commands;

use crate::error::ApiError;
use crate::routes::{CommandResponse, OwnerId, owner_from_headers};
use crate::state::{AppState, Backend};

/// Request body for POST /.
#[derive(Debug, Deserialize)]
pub struct CreateItemRequest {
    /// Item name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for PATCH /{id}.
#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Query string for GET /.
#[derive(Debug, Deserialize)]
pub struct ListItemsQuery {
    /// Owner whose items to list; defaults to the acting owner.
    pub owner_id: Option<Uuid>,
}

/// POST /
#[instrument(skip_all, fields(owner_id = %owner_id))]
async fn create_item<F: Backend>(
    State(state): State<AppState<F>>,
    OwnerId(owner_id): OwnerId,
    Json(request): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let command = commands::CreateItem {
        correlation_id: Uuid::new_v4(),
        owner_id,
        name: request.name,
        description: request.description,
    };

    info!(correlation_id = %command.correlation_id, "handling create_item command");

    let result =
        command_handlers::handle_create_item(&command, state.clock.as_ref(), state.unit_of_work())
            .await?;

    Ok((
        StatusCode::CREATED,
        Json(CommandResponse::new(
            result.aggregate_id,
            result.version,
            &result.receipt,
        )),
    ))
}

/// PATCH /{id}
#[instrument(skip_all, fields(item_id = %item_id))]
async fn update_item<F: Backend>(
    State(state): State<AppState<F>>,
    OwnerId(owner_id): OwnerId,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateItemRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = commands::UpdateItem {
        correlation_id: Uuid::new_v4(),
        item_id,
        owner_id,
        name: request.name,
        description: request.description,
    };

    info!(correlation_id = %command.correlation_id, "handling update_item command");

    let result =
        command_handlers::handle_update_item(&command, state.clock.as_ref(), state.unit_of_work())
            .await?;

    Ok(Json(CommandResponse::new(
        result.aggregate_id,
        result.version,
        &result.receipt,
    )))
}

/// DELETE /{id}
#[instrument(skip_all, fields(item_id = %item_id))]
async fn delete_item<F: Backend>(
    State(state): State<AppState<F>>,
    OwnerId(owner_id): OwnerId,
    Path(item_id): Path<Uuid>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = commands::DeleteItem {
        correlation_id: Uuid::new_v4(),
        item_id,
        owner_id,
    };

    info!(correlation_id = %command.correlation_id, "handling delete_item command");

    let result =
        command_handlers::handle_delete_item(&command, state.clock.as_ref(), state.unit_of_work())
            .await?;

    Ok(Json(CommandResponse::new(
        result.aggregate_id,
        result.version,
        &result.receipt,
    )))
}

/// GET /{id}
async fn get_item<F: Backend>(
    State(state): State<AppState<F>>,
    OwnerId(owner_id): OwnerId,
    Path(item_id): Path<Uuid>,
) -> Result<Json<ItemView>, ApiError> {
    let view = query_handlers::get_item_by_id(item_id, owner_id, state.unit_of_work()).await?;
    Ok(Json(view))
}

/// GET /?owner_id=
async fn list_items<F: Backend>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(query): Query<ListItemsQuery>,
) -> Result<Json<Vec<ItemView>>, ApiError> {
    let owner_id = match query.owner_id {
        Some(owner_id) => owner_id,
        None => owner_from_headers(&headers)?,
    };
    let views = query_handlers::list_items_by_owner(owner_id, state.unit_of_work()).await?;
    Ok(Json(views))
}

/// Returns the router for the item context.
pub fn router<F: Backend>() -> Router<AppState<F>> {
    Router::new()
        .route("/", post(create_item::<F>).get(list_items::<F>))
        .route(
            "/{id}",
            get(get_item::<F>)
                .patch(update_item::<F>)
                .delete(delete_item::<F>),
        )
}
