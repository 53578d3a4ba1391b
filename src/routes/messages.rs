use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{created, ok, record};
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        message::{MessageListQuery, SendMessageRequest},
    },
    services::messages::MessageService,
    AppState,
};

pub async fn send(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let message = MessageService::send(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "message", message.id);
    Ok(created(message))
}

pub async fn inbox(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<MessageListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(MessageService::inbox(&state.db, actor.id, &q).await?))
}

pub async fn sent(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<MessageListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(MessageService::sent(&state.db, actor.id, &q).await?))
}

pub async fn unread_count(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    let count = MessageService::unread_count(&state.db, actor.id).await?;
    Ok(Json(json!({ "unread": count })))
}

pub async fn thread(
    State(state): State<AppState>,
    actor: Actor,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(MessageService::thread(&state.db, actor.id, thread_id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    MessageService::mark_read(&state.db, actor.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_thread_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let updated = MessageService::mark_thread_read(&state.db, actor.id, thread_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

pub async fn delete(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    MessageService::delete(&state.db, &actor, id).await?;
    record(&state, &actor, &client, ActionType::Delete, "message", id);
    Ok(StatusCode::NO_CONTENT)
}
