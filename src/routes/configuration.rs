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
        configuration::{
            ConfigurationListQuery, CreateConfigurationRequest, ResolveConfigurationQuery, UpdateConfigurationRequest,
        },
    },
    services::configuration::ConfigurationService,
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<ConfigurationListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(ConfigurationService::list(&state.db, &actor, &q).await?))
}

pub async fn get(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(ok(ConfigurationService::get(&state.db, &actor, id).await?))
}

/// Effective value of a key, walking school then workstream then global.
pub async fn resolve(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<ResolveConfigurationQuery>,
) -> Result<Json<Value>, AppError> {
    let resolved = ConfigurationService::resolve(&state.db, &actor, &q.key, q.school_id, q.work_stream_id).await?;
    Ok(ok(resolved))
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateConfigurationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let config = ConfigurationService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "system_configuration", config.id);
    Ok(created(config))
}

pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateConfigurationRequest>,
) -> Result<Json<Value>, AppError> {
    let config = ConfigurationService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "system_configuration", id);
    Ok(ok(config))
}

pub async fn deactivate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ConfigurationService::set_active(&state.db, &actor, id, false).await?;
    Ok(toggled(&state, &actor, &client, "system_configuration", id, false))
}

pub async fn activate(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ConfigurationService::set_active(&state.db, &actor, id, true).await?;
    Ok(toggled(&state, &actor, &client, "system_configuration", id, true))
}
