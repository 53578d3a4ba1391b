use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::{created, ok, record, toggled};
use crate::{
    errors::AppError,
    middleware::workstream::CurrentWorkStream,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        workstream::{CreateWorkStreamRequest, UpdateWorkStreamRequest, WorkStreamListQuery},
    },
    services::workstreams::WorkStreamService,
    AppState,
};

/// Public: identifies the workstream site a visitor landed on.
pub async fn public_info(
    State(state): State<AppState>,
    workstream: CurrentWorkStream,
) -> Result<Json<Value>, AppError> {
    Ok(ok(WorkStreamService::info(&state.db, workstream.id).await?))
}

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<WorkStreamListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(WorkStreamService::list(&state.db, &actor, &q).await?))
}

pub async fn get(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(ok(WorkStreamService::get(&state.db, &actor, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateWorkStreamRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let ws = WorkStreamService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "work_stream", ws.id);
    Ok(created(ws))
}

pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWorkStreamRequest>,
) -> Result<Json<Value>, AppError> {
    let ws = WorkStreamService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "work_stream", id);
    Ok(ok(ws))
}

pub async fn deactivate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    WorkStreamService::deactivate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "work_stream", id, false))
}

pub async fn activate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    WorkStreamService::activate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "work_stream", id, true))
}
