use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::{created, ok, record, toggled, welcome};
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        user::{CreateUserRequest, UpdateUserRequest, UserListQuery},
    },
    services::users::UserService,
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<UserListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(UserService::list(&state.db, &actor, &q).await?))
}

pub async fn get(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(ok(UserService::get(&state.db, &actor, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let user = UserService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "user", user.id);
    welcome(&state, &user.email, &user.full_name, user.role());
    Ok(created(user))
}

pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<Value>, AppError> {
    let user = UserService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "user", id);
    Ok(ok(user))
}

pub async fn deactivate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    UserService::deactivate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "user", id, false))
}

pub async fn activate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    UserService::activate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "user", id, true))
}

/// Hard delete, admin only.
pub async fn delete(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    UserService::delete(&state.db, &actor, id).await?;
    record(&state, &actor, &client, ActionType::Delete, "user", id);
    Ok(StatusCode::NO_CONTENT)
}
