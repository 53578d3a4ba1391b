use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::ok;
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        notification::{NotificationListQuery, SendNotificationRequest},
    },
    services::{
        audit::{self, AuditEntry},
        notifications::NotificationService,
    },
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<NotificationListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(NotificationService::list(&state.db, actor.id, &q).await?))
}

/// Fans a notification out to a user, a school or a workstream.
pub async fn send(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<SendNotificationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let scope = body.scope;
    let target = body.target_id;
    let delivered = NotificationService::send(&state.db, &actor, body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Create, "notification", target)
            .describe(format!("Sent {} notification to {delivered} recipients", scope.as_str()))
            .from_client(&client),
    );
    Ok((StatusCode::CREATED, Json(json!({ "delivered": delivered }))))
}

pub async fn unread_count(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    let count = NotificationService::unread_count(&state.db, actor.id).await?;
    Ok(Json(json!({ "unread": count })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(NotificationService::mark_read(&state.db, actor.id, id).await?))
}

pub async fn mark_all_read(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    let updated = NotificationService::mark_all_read(&state.db, actor.id).await?;
    Ok(Json(json!({ "updated": updated })))
}

pub async fn delete(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    NotificationService::delete(&state.db, actor.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
