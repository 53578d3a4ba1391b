use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::{created, ok, record};
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        support::{
            CreateEvaluationRequest, CreateTicketRequest, EvaluationListQuery, TicketListQuery,
            UpdateEvaluationRequest, UpdateTicketRequest,
        },
    },
    services::{evaluations::EvaluationService, support::SupportService},
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<TicketListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(SupportService::list(&state.db, &actor, &q).await?))
}

pub async fn get(State(state): State<AppState>, actor: Actor, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    Ok(ok(SupportService::get(&state.db, &actor, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let ticket = SupportService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "support_ticket", &ticket.ticket_id);
    Ok(created(ticket))
}

pub async fn update(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTicketRequest>,
) -> Result<Json<Value>, AppError> {
    let ticket = SupportService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "support_ticket", &ticket.ticket_id);
    Ok(ok(ticket))
}

pub async fn delete(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    SupportService::delete(&state.db, &actor, id).await?;
    record(&state, &actor, &client, ActionType::Delete, "support_ticket", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stats(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    Ok(Json(SupportService::stats(&state.db, &actor).await?))
}

pub async fn list_evaluations(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<EvaluationListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(EvaluationService::list(&state.db, &actor, &q).await?))
}

pub async fn get_evaluation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(EvaluationService::get(&state.db, &actor, id).await?))
}

pub async fn create_evaluation(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateEvaluationRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let evaluation = EvaluationService::create(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "staff_evaluation", evaluation.id);
    Ok(created(evaluation))
}

pub async fn update_evaluation(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateEvaluationRequest>,
) -> Result<Json<Value>, AppError> {
    let evaluation = EvaluationService::update(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "staff_evaluation", id);
    Ok(ok(evaluation))
}

pub async fn delete_evaluation(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    EvaluationService::delete(&state.db, &actor, id).await?;
    record(&state, &actor, &client, ActionType::Delete, "staff_evaluation", id);
    Ok(StatusCode::NO_CONTENT)
}
