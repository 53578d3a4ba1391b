use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::{created, ok};
use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        guardian::{CreateGuardianRequest, LinkStudentRequest, UpdateGuardianRequest},
        user::UserRole,
    },
    services::{
        audit::{self, AuditEntry},
        guardians::GuardianService,
    },
    AppState,
};

profile_handlers!(GuardianService, "guardian", UserRole::Guardian, CreateGuardianRequest, UpdateGuardianRequest);

pub async fn students(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(GuardianService::students(&state.db, &actor, id).await?))
}

pub async fn link_student(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<LinkStudentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let link = GuardianService::link_student(&state.db, &actor, id, body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Create, "guardian_student", link.id)
            .describe(format!("Linked student {} to guardian {id}", link.student_id))
            .from_client(&client),
    );
    Ok(created(link))
}

pub async fn unlink_student(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path((id, student_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    GuardianService::unlink_student(&state.db, &actor, id, student_id).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Delete, "guardian_student", id)
            .describe(format!("Unlinked student {student_id} from guardian {id}"))
            .from_client(&client),
    );
    Ok(StatusCode::NO_CONTENT)
}
