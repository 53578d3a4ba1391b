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
        coursework::CourseworkListQuery,
        student::{
            CreateEnrollmentRequest, CreateStudentRequest, EnrollmentListQuery, UpdateEnrollmentRequest,
            UpdateStudentRequest,
        },
        user::UserRole,
    },
    services::{coursework::CourseworkService, students::StudentService},
    AppState,
};

profile_handlers!(StudentService, "student", UserRole::Student, CreateStudentRequest, UpdateStudentRequest);

pub async fn enrollments_of(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(StudentService::enrollments_of(&state.db, &actor, id).await?))
}

/// Marks of one student; the profile lookup enforces visibility first.
pub async fn marks_of(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Query(mut q): Query<CourseworkListQuery>,
) -> Result<Json<Value>, AppError> {
    StudentService::get(&state.db, &actor, id).await?;
    q.student_id = Some(id);
    Ok(ok(CourseworkService::list_marks(&state.db, &actor, &q).await?))
}

pub async fn attendance_of(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Query(mut q): Query<CourseworkListQuery>,
) -> Result<Json<Value>, AppError> {
    StudentService::get(&state.db, &actor, id).await?;
    q.student_id = Some(id);
    Ok(ok(CourseworkService::list_attendance(&state.db, &actor, &q).await?))
}

pub async fn list_enrollments(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<EnrollmentListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(StudentService::list_enrollments(&state.db, &actor, &q).await?))
}

pub async fn get_enrollment(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(StudentService::get_enrollment(&state.db, &actor, id).await?))
}

pub async fn enroll(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<CreateEnrollmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let enrollment = StudentService::enroll(&state.db, &actor, body).await?;
    record(&state, &actor, &client, ActionType::Create, "student_enrollment", enrollment.id);
    Ok(created(enrollment))
}

pub async fn update_enrollment(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateEnrollmentRequest>,
) -> Result<Json<Value>, AppError> {
    let enrollment = StudentService::update_enrollment(&state.db, &actor, id, body).await?;
    record(&state, &actor, &client, ActionType::Update, "student_enrollment", id);
    Ok(ok(enrollment))
}

pub async fn deactivate_enrollment(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    StudentService::set_enrollment_active(&state.db, &actor, id, false).await?;
    Ok(toggled(&state, &actor, &client, "student_enrollment", id, false))
}

pub async fn activate_enrollment(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    StudentService::set_enrollment_active(&state.db, &actor, id, true).await?;
    Ok(toggled(&state, &actor, &client, "student_enrollment", id, true))
}
