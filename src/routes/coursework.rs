use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        coursework::{
            BulkAttendanceRequest, BulkMarksRequest, CourseworkListQuery, CreateAllocationRequest,
            CreateAssignmentRequest, CreateAttendanceRequest, CreateLearningMaterialRequest, CreateLessonPlanRequest,
            CreateMarkRequest, UpdateAllocationRequest, UpdateAssignmentRequest, UpdateAttendanceRequest,
            UpdateLearningMaterialRequest, UpdateLessonPlanRequest, UpdateMarkRequest,
        },
    },
    services::{
        audit::{self, AuditEntry},
        coursework::CourseworkService,
    },
    AppState,
};

managed_handlers! {
    CourseworkService, "course_allocation",
    list: list_allocations => list_allocations(CourseworkListQuery),
    get: get_allocation => get_allocation,
    create: create_allocation => create_allocation(CreateAllocationRequest),
    update: update_allocation => update_allocation(UpdateAllocationRequest),
    toggle: deactivate_allocation, activate_allocation => set_allocation_active,
}

managed_handlers! {
    CourseworkService, "assignment",
    list: list_assignments => list_assignments(CourseworkListQuery),
    get: get_assignment => get_assignment,
    create: create_assignment => create_assignment(CreateAssignmentRequest),
    update: update_assignment => update_assignment(UpdateAssignmentRequest),
    toggle: deactivate_assignment, activate_assignment => set_assignment_active,
}

managed_handlers! {
    CourseworkService, "mark",
    list: list_marks => list_marks(CourseworkListQuery),
    get: get_mark => get_mark,
    create: record_mark => record_mark(CreateMarkRequest),
    update: update_mark => update_mark(UpdateMarkRequest),
    toggle: deactivate_mark, activate_mark => set_mark_active,
}

managed_handlers! {
    CourseworkService, "attendance",
    list: list_attendance => list_attendance(CourseworkListQuery),
    get: get_attendance => get_attendance,
    create: record_attendance => record_attendance(CreateAttendanceRequest),
    update: update_attendance => update_attendance(UpdateAttendanceRequest),
    toggle: deactivate_attendance, activate_attendance => set_attendance_active,
}

managed_handlers! {
    CourseworkService, "lesson_plan",
    list: list_lesson_plans => list_lesson_plans(CourseworkListQuery),
    get: get_lesson_plan => get_lesson_plan,
    create: create_lesson_plan => create_lesson_plan(CreateLessonPlanRequest),
    update: update_lesson_plan => update_lesson_plan(UpdateLessonPlanRequest),
    toggle: deactivate_lesson_plan, activate_lesson_plan => set_lesson_plan_active,
}

managed_handlers! {
    CourseworkService, "learning_material",
    list: list_materials => list_materials(CourseworkListQuery),
    get: get_material => get_material,
    create: create_material => create_material(CreateLearningMaterialRequest),
    update: update_material => update_material(UpdateLearningMaterialRequest),
    toggle: deactivate_material, activate_material => set_material_active,
}

/// Grades a whole assignment in one transaction.
pub async fn record_marks(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Path(assignment_id): Path<Uuid>,
    Json(body): Json<BulkMarksRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let marks = CourseworkService::record_marks(&state.db, &actor, assignment_id, body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Create, "mark", assignment_id)
            .describe(format!("{} recorded {} marks for assignment {assignment_id}", actor.email, marks.len()))
            .from_client(&client),
    );
    Ok((StatusCode::CREATED, Json(json!({ "count": marks.len(), "results": marks }))))
}

pub async fn record_attendance_bulk(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<BulkAttendanceRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let allocation = body.course_allocation_id;
    let rows = CourseworkService::record_attendance_bulk(&state.db, &actor, body).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Create, "attendance", allocation)
            .describe(format!("{} recorded attendance for {} students", actor.email, rows.len()))
            .from_client(&client),
    );
    Ok((StatusCode::CREATED, Json(json!({ "count": rows.len(), "results": rows }))))
}
