/// Generates the list/get/create/update/deactivate/activate handlers for a
/// school-managed resource whose service exposes a `set_*_active` toggle.
macro_rules! managed_handlers {
    (
        $service:ident, $entity:literal,
        list: $list:ident => $svc_list:ident($query:ty),
        get: $get:ident => $svc_get:ident,
        create: $create:ident => $svc_create:ident($create_req:ty),
        update: $update:ident => $svc_update:ident($update_req:ty),
        toggle: $deactivate:ident, $activate:ident => $svc_toggle:ident $(,)?
    ) => {
        pub async fn $list(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            axum::extract::Query(q): axum::extract::Query<$query>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            Ok(super::ok($service::$svc_list(&state.db, &actor, &q).await?))
        }

        pub async fn $get(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            Ok(super::ok($service::$svc_get(&state.db, &actor, id).await?))
        }

        pub async fn $create(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::Json(body): axum::Json<$create_req>,
        ) -> Result<(axum::http::StatusCode, axum::Json<serde_json::Value>), crate::errors::AppError> {
            let row = $service::$svc_create(&state.db, &actor, body).await?;
            super::record(&state, &actor, &client, crate::models::activity::ActionType::Create, $entity, row.id);
            Ok(super::created(row))
        }

        pub async fn $update(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
            axum::Json(body): axum::Json<$update_req>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            let row = $service::$svc_update(&state.db, &actor, id, body).await?;
            super::record(&state, &actor, &client, crate::models::activity::ActionType::Update, $entity, id);
            Ok(super::ok(row))
        }

        pub async fn $deactivate(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            $service::$svc_toggle(&state.db, &actor, id, false).await?;
            Ok(super::toggled(&state, &actor, &client, $entity, id, false))
        }

        pub async fn $activate(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            $service::$svc_toggle(&state.db, &actor, id, true).await?;
            Ok(super::toggled(&state, &actor, &client, $entity, id, true))
        }
    };
}

/// Handlers for a profile resource backed by a user account. Creation also
/// sends the welcome email.
macro_rules! profile_handlers {
    ($service:ident, $entity:literal, $role:expr, $create_req:ty, $update_req:ty $(,)?) => {
        pub async fn list(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            axum::extract::Query(q): axum::extract::Query<crate::models::teacher::ProfileListQuery>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            Ok(super::ok($service::list(&state.db, &actor, &q).await?))
        }

        pub async fn get(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            Ok(super::ok($service::get(&state.db, &actor, id).await?))
        }

        pub async fn create(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::Json(body): axum::Json<$create_req>,
        ) -> Result<(axum::http::StatusCode, axum::Json<serde_json::Value>), crate::errors::AppError> {
            let profile = $service::create(&state.db, &actor, body).await?;
            super::record(&state, &actor, &client, crate::models::activity::ActionType::Create, $entity, profile.user_id);
            super::welcome(&state, &profile.email, &profile.full_name, $role);
            Ok(super::created(profile))
        }

        pub async fn update(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
            axum::Json(body): axum::Json<$update_req>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            let profile = $service::update(&state.db, &actor, id, body).await?;
            super::record(&state, &actor, &client, crate::models::activity::ActionType::Update, $entity, id);
            Ok(super::ok(profile))
        }

        pub async fn deactivate(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            $service::set_active(&state.db, &actor, id, false).await?;
            Ok(super::toggled(&state, &actor, &client, $entity, id, false))
        }

        pub async fn activate(
            axum::extract::State(state): axum::extract::State<crate::AppState>,
            actor: crate::models::auth::Actor,
            client: crate::models::auth::ClientInfo,
            axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
        ) -> Result<axum::Json<serde_json::Value>, crate::errors::AppError> {
            $service::set_active(&state.db, &actor, id, true).await?;
            Ok(super::toggled(&state, &actor, &client, $entity, id, true))
        }
    };
}

pub mod academic;
pub mod activity;
pub mod auth;
pub mod configuration;
pub mod coursework;
pub mod guardians;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod notifications;
pub mod reports;
pub mod schools;
pub mod secretaries;
pub mod students;
pub mod support;
pub mod teachers;
pub mod users;
pub mod workstreams;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    models::{
        activity::ActionType,
        auth::{Actor, ClientInfo},
        user::UserRole,
    },
    services::audit::{self, AuditEntry},
    AppState,
};

/// Every `/api` route. Layers (auth secret, tracing, CORS) are added by the binary.
pub fn api_router() -> Router<AppState> {
    Router::new()
        // Auth
        .route("/api/auth/register", post(auth::portal_register))
        .route("/api/auth/login", post(auth::portal_login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/password-reset", post(auth::request_password_reset))
        .route("/api/auth/password-reset/confirm", post(auth::reset_password))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/change-password", post(auth::change_password))
        // Workstream sites
        .route("/api/workstream/info", get(workstreams::public_info))
        .route("/api/workstream/register", post(auth::workstream_register))
        .route("/api/workstream/login", post(auth::workstream_login))
        // Users
        .route("/api/users", get(users::list).post(users::create))
        .route("/api/users/{id}", get(users::get).put(users::update).delete(users::delete))
        .route("/api/users/{id}/deactivate", post(users::deactivate))
        .route("/api/users/{id}/activate", post(users::activate))
        // Workstreams and schools
        .route("/api/workstreams", get(workstreams::list).post(workstreams::create))
        .route(
            "/api/workstreams/{id}",
            get(workstreams::get).put(workstreams::update).delete(workstreams::deactivate),
        )
        .route("/api/workstreams/{id}/activate", post(workstreams::activate))
        .route("/api/schools", get(schools::list).post(schools::create))
        .route("/api/schools/{id}", get(schools::get).put(schools::update).delete(schools::deactivate))
        .route("/api/schools/{id}/activate", post(schools::activate))
        // Academic structure
        .route("/api/academic-years", get(academic::list_years).post(academic::create_year))
        .route(
            "/api/academic-years/{id}",
            get(academic::get_year).put(academic::update_year).delete(academic::deactivate_year),
        )
        .route("/api/academic-years/{id}/activate", post(academic::activate_year))
        .route("/api/grades", get(academic::list_grades).post(academic::create_grade))
        .route(
            "/api/grades/{id}",
            get(academic::get_grade).put(academic::update_grade).delete(academic::deactivate_grade),
        )
        .route("/api/grades/{id}/activate", post(academic::activate_grade))
        .route("/api/courses", get(academic::list_courses).post(academic::create_course))
        .route(
            "/api/courses/{id}",
            get(academic::get_course).put(academic::update_course).delete(academic::deactivate_course),
        )
        .route("/api/courses/{id}/activate", post(academic::activate_course))
        .route("/api/classrooms", get(academic::list_class_rooms).post(academic::create_class_room))
        .route(
            "/api/classrooms/{id}",
            get(academic::get_class_room)
                .put(academic::update_class_room)
                .delete(academic::deactivate_class_room),
        )
        .route("/api/classrooms/{id}/activate", post(academic::activate_class_room))
        // Profiles
        .route("/api/teachers", get(teachers::list).post(teachers::create))
        .route("/api/teachers/{id}", get(teachers::get).put(teachers::update).delete(teachers::deactivate))
        .route("/api/teachers/{id}/activate", post(teachers::activate))
        .route("/api/students", get(students::list).post(students::create))
        .route("/api/students/{id}", get(students::get).put(students::update).delete(students::deactivate))
        .route("/api/students/{id}/activate", post(students::activate))
        .route("/api/students/{id}/enrollments", get(students::enrollments_of))
        .route("/api/students/{id}/marks", get(students::marks_of))
        .route("/api/students/{id}/attendance", get(students::attendance_of))
        .route("/api/enrollments", get(students::list_enrollments).post(students::enroll))
        .route(
            "/api/enrollments/{id}",
            get(students::get_enrollment)
                .put(students::update_enrollment)
                .delete(students::deactivate_enrollment),
        )
        .route("/api/enrollments/{id}/activate", post(students::activate_enrollment))
        .route("/api/guardians", get(guardians::list).post(guardians::create))
        .route("/api/guardians/{id}", get(guardians::get).put(guardians::update).delete(guardians::deactivate))
        .route("/api/guardians/{id}/activate", post(guardians::activate))
        .route("/api/guardians/{id}/students", get(guardians::students).post(guardians::link_student))
        .route("/api/guardians/{id}/students/{student_id}", axum::routing::delete(guardians::unlink_student))
        .route("/api/secretaries", get(secretaries::list).post(secretaries::create))
        .route(
            "/api/secretaries/{id}",
            get(secretaries::get).put(secretaries::update).delete(secretaries::deactivate),
        )
        .route("/api/secretaries/{id}/activate", post(secretaries::activate))
        // Coursework
        .route("/api/allocations", get(coursework::list_allocations).post(coursework::create_allocation))
        .route(
            "/api/allocations/{id}",
            get(coursework::get_allocation)
                .put(coursework::update_allocation)
                .delete(coursework::deactivate_allocation),
        )
        .route("/api/allocations/{id}/activate", post(coursework::activate_allocation))
        .route("/api/assignments", get(coursework::list_assignments).post(coursework::create_assignment))
        .route(
            "/api/assignments/{id}",
            get(coursework::get_assignment)
                .put(coursework::update_assignment)
                .delete(coursework::deactivate_assignment),
        )
        .route("/api/assignments/{id}/activate", post(coursework::activate_assignment))
        .route("/api/assignments/{id}/marks", post(coursework::record_marks))
        .route("/api/marks", get(coursework::list_marks).post(coursework::record_mark))
        .route(
            "/api/marks/{id}",
            get(coursework::get_mark).put(coursework::update_mark).delete(coursework::deactivate_mark),
        )
        .route("/api/marks/{id}/activate", post(coursework::activate_mark))
        .route("/api/attendance", get(coursework::list_attendance).post(coursework::record_attendance))
        .route("/api/attendance/bulk", post(coursework::record_attendance_bulk))
        .route(
            "/api/attendance/{id}",
            get(coursework::get_attendance)
                .put(coursework::update_attendance)
                .delete(coursework::deactivate_attendance),
        )
        .route("/api/attendance/{id}/activate", post(coursework::activate_attendance))
        .route("/api/lesson-plans", get(coursework::list_lesson_plans).post(coursework::create_lesson_plan))
        .route(
            "/api/lesson-plans/{id}",
            get(coursework::get_lesson_plan)
                .put(coursework::update_lesson_plan)
                .delete(coursework::deactivate_lesson_plan),
        )
        .route("/api/lesson-plans/{id}/activate", post(coursework::activate_lesson_plan))
        .route("/api/materials", get(coursework::list_materials).post(coursework::create_material))
        .route(
            "/api/materials/{id}",
            get(coursework::get_material)
                .put(coursework::update_material)
                .delete(coursework::deactivate_material),
        )
        .route("/api/materials/{id}/activate", post(coursework::activate_material))
        // Configuration
        .route("/api/configurations", get(configuration::list).post(configuration::create))
        .route("/api/configurations/resolve", get(configuration::resolve))
        .route(
            "/api/configurations/{id}",
            get(configuration::get).put(configuration::update).delete(configuration::deactivate),
        )
        .route("/api/configurations/{id}/activate", post(configuration::activate))
        // Notifications
        .route("/api/notifications", get(notifications::list))
        .route("/api/notifications/send", post(notifications::send))
        .route("/api/notifications/unread-count", get(notifications::unread_count))
        .route("/api/notifications/read-all", post(notifications::mark_all_read))
        .route("/api/notifications/{id}", axum::routing::delete(notifications::delete))
        .route("/api/notifications/{id}/read", post(notifications::mark_read))
        // Messages
        .route("/api/messages", post(messages::send))
        .route("/api/messages/inbox", get(messages::inbox))
        .route("/api/messages/sent", get(messages::sent))
        .route("/api/messages/unread-count", get(messages::unread_count))
        .route("/api/messages/thread/{thread_id}", get(messages::thread))
        .route("/api/messages/thread/{thread_id}/read", post(messages::mark_thread_read))
        .route("/api/messages/{id}", axum::routing::delete(messages::delete))
        .route("/api/messages/{id}/read", post(messages::mark_read))
        // Reports
        .route("/api/reports/dashboard", get(reports::dashboard))
        .route("/api/reports/export", get(reports::export))
        .route("/api/statistics/workstream/{id}", get(reports::workstream))
        .route("/api/statistics/school/{id}", get(reports::school))
        .route("/api/statistics/teacher/{id}", get(reports::teacher))
        .route("/api/statistics/classroom/{id}", get(reports::class_room))
        .route("/api/statistics/course/{id}", get(reports::course))
        .route("/api/statistics/student/{id}", get(reports::student))
        .route("/api/statistics/login-activity", get(reports::login_activity))
        // Support and evaluations
        .route("/api/support-tickets", get(support::list).post(support::create))
        .route("/api/support-tickets/stats", get(support::stats))
        .route("/api/support-tickets/{id}", get(support::get).put(support::update).delete(support::delete))
        .route("/api/evaluations", get(support::list_evaluations).post(support::create_evaluation))
        .route(
            "/api/evaluations/{id}",
            get(support::get_evaluation)
                .put(support::update_evaluation)
                .delete(support::delete_evaluation),
        )
        // Audit
        .route("/api/activity-logs", get(activity::list))
}

/// 201 with the created object as body.
pub fn created<T: Serialize>(value: T) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(json!(value)))
}

pub fn ok<T: Serialize>(value: T) -> Json<Value> {
    Json(json!(value))
}

/// Fire-and-forget activity entry for a mutation.
pub fn record(
    state: &AppState,
    actor: &Actor,
    client: &ClientInfo,
    action: ActionType,
    entity: &'static str,
    id: impl ToString,
) {
    audit::log(state.db.clone(), AuditEntry::new(actor, action, entity, id).from_client(client));
}

/// Sends the welcome email in the background once the account is committed.
pub fn welcome(state: &AppState, email: &str, full_name: &str, role: UserRole) {
    let Some(svc) = state.email.clone() else {
        return;
    };
    let to = email.to_string();
    let name = full_name.to_string();
    let login_url = format!("{}/login", state.config.app_base_url.trim_end_matches('/'));
    tokio::spawn(async move {
        if let Err(e) = svc.send_welcome(&to, &name, role.as_str(), &login_url).await {
            tracing::warn!("welcome email to {to} failed: {e:#}");
        }
    });
}

/// Logs an activation change and answers with the new state.
pub fn toggled(
    state: &AppState,
    actor: &Actor,
    client: &ClientInfo,
    entity: &'static str,
    id: Uuid,
    active: bool,
) -> Json<Value> {
    let change = if active { "activated" } else { "deactivated" };
    audit::log(
        state.db.clone(),
        AuditEntry::new(actor, ActionType::Update, entity, id)
            .describe(format!("{} {change} {entity} {id}", actor.email))
            .from_client(client),
    );
    Json(json!({ "id": id, "is_active": active }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_routes_do_not_overlap() {
        // axum panics on conflicting paths while the router is assembled.
        let _ = api_router();
    }

    #[test]
    fn created_wraps_in_201() {
        let (status, Json(body)) = created(json!({ "id": 1 }));
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], 1);
    }
}
