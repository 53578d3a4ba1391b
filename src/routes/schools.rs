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
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        school::{CreateSchoolRequest, SchoolListQuery, UpdateSchoolRequest},
    },
    services::schools::SchoolService,
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<SchoolListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(SchoolService::list(&state.db, &actor, &q).await?))
}

pub async fn get(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(ok(SchoolService::get(&state.db, &actor, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateSchoolRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let school = SchoolService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "school", school.id);
    Ok(created(school))
}

pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSchoolRequest>,
) -> Result<Json<Value>, AppError> {
    let school = SchoolService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "school", id);
    Ok(ok(school))
}

pub async fn deactivate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    SchoolService::deactivate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "school", id, false))
}

pub async fn activate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    SchoolService::activate(&state.db, &actor, id).await?;
    Ok(toggled(&state, &actor, &client, "school", id, true))
}
