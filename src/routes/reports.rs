use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::ok;
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        report::{ExportQuery, LoginActivityQuery},
    },
    services::{
        audit::{self, AuditEntry},
        export::ExportService,
        reports::ReportService,
    },
    AppState,
};

pub async fn dashboard(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    Ok(ok(ReportService::dashboard(&state.db, &actor).await?))
}

/// Streams the export back as a downloadable attachment.
pub async fn export(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Query(q): Query<ExportQuery>,
) -> Result<Response, AppError> {
    let file = ExportService::export(&state.db, &actor, &q).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Export, q.entity.as_str(), &file.filename)
            .describe(format!("Exported {} {} rows", file.rows, q.entity.as_str()))
            .from_client(&client),
    );

    let disposition = format!("attachment; filename=\"{}\"", file.filename);
    Ok((
        [(header::CONTENT_TYPE, file.content_type.to_string()), (header::CONTENT_DISPOSITION, disposition)],
        file.body,
    )
        .into_response())
}

pub async fn workstream(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::workstream(&state.db, &actor, id).await?))
}

pub async fn school(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::school(&state.db, &actor, id).await?))
}

pub async fn teacher(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::teacher(&state.db, &actor, id).await?))
}

pub async fn class_room(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::class_room(&state.db, &actor, id).await?))
}

pub async fn course(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::course(&state.db, &actor, id).await?))
}

pub async fn student(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::student(&state.db, &actor, id).await?))
}

pub async fn login_activity(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<LoginActivityQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(ReportService::login_activity(&state.db, &actor, &q).await?))
}
