//! Routes for the IAM bounded context.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use keel_iam::application::query_handlers::UserView;
use keel_iam::application::{command_handlers, query_handlers};
use keel_iam::domain::commands;

use crate::error::ApiError;
use crate::routes::CommandResponse;
use crate::state::{AppState, Backend};

/// Request body for POST /.
#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    /// Requested login name.
    pub username: String,
    /// Contact address.
    pub email: String,
}

/// Request body for PATCH /{id}.
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    /// New contact address.
    #[serde(default)]
    pub email: Option<String>,
    /// New avatar URL.
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

/// POST /
#[instrument(skip_all, fields(username = %request.username))]
async fn register_user<F: Backend>(
    State(state): State<AppState<F>>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let command = commands::RegisterUser {
        correlation_id: Uuid::new_v4(),
        username: request.username,
        email: request.email,
    };

    info!(correlation_id = %command.correlation_id, "handling register_user command");

    let result =
        command_handlers::handle_register_user(&command, state.clock.as_ref(), state.unit_of_work())
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

/// POST /{id}/deactivate
#[instrument(skip_all, fields(user_id = %user_id))]
async fn deactivate_user<F: Backend>(
    State(state): State<AppState<F>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = commands::DeactivateUser {
        correlation_id: Uuid::new_v4(),
        user_id,
    };

    info!(correlation_id = %command.correlation_id, "handling deactivate_user command");

    let result = command_handlers::handle_deactivate_user(
        &command,
        state.clock.as_ref(),
        state.unit_of_work(),
    )
    .await?;

    Ok(Json(CommandResponse::new(
        result.aggregate_id,
        result.version,
        &result.receipt,
    )))
}

/// POST /{id}/activate
#[instrument(skip_all, fields(user_id = %user_id))]
async fn activate_user<F: Backend>(
    State(state): State<AppState<F>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = commands::ActivateUser {
        correlation_id: Uuid::new_v4(),
        user_id,
    };

    info!(correlation_id = %command.correlation_id, "handling activate_user command");

    let result =
        command_handlers::handle_activate_user(&command, state.clock.as_ref(), state.unit_of_work())
            .await?;

    Ok(Json(CommandResponse::new(
        result.aggregate_id,
        result.version,
        &result.receipt,
    )))
}

/// PATCH /{id}
#[instrument(skip_all, fields(user_id = %user_id))]
async fn update_profile<F: Backend>(
    State(state): State<AppState<F>>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = commands::UpdateProfile {
        correlation_id: Uuid::new_v4(),
        user_id,
        email: request.email,
        profile_picture_url: request.profile_picture_url,
    };

    info!(correlation_id = %command.correlation_id, "handling update_profile command");

    let result =
        command_handlers::handle_update_profile(&command, state.clock.as_ref(), state.unit_of_work())
            .await?;

    Ok(Json(CommandResponse::new(
        result.aggregate_id,
        result.version,
        &result.receipt,
    )))
}

/// GET /{id}
async fn get_user<F: Backend>(
    State(state): State<AppState<F>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserView>, ApiError> {
    let view = query_handlers::get_user_by_id(user_id, state.unit_of_work()).await?;
    Ok(Json(view))
}

/// Returns the router for the IAM context.
pub fn router<F: Backend>() -> Router<AppState<F>> {
    Router::new()
        .route("/", post(register_user::<F>))
        .route("/{id}", get(get_user::<F>).patch(update_profile::<F>))
        .route("/{id}/deactivate", post(deactivate_user::<F>))
        .route("/{id}/activate", post(activate_user::<F>))
}
