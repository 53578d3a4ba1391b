use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Field-keyed validation messages, serialised as `{"field": ["msg", ...]}`.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation failed")]
    Validation(FieldErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many attempts. Try again in a few minutes.")]
    TooManyRequests,

    #[error("Database error")]
    Database(#[source] sqlx::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Single-field validation error.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        AppError::Validation(errors)
    }

    pub fn forbidden() -> Self {
        AppError::PermissionDenied("You do not have permission to perform this action.".into())
    }

    pub fn not_found(entity: &str) -> Self {
        AppError::NotFound(format!("{entity} not found"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            AppError::Validation(fields) => json!({ "error": self.to_string(), "fields": fields }),
            AppError::Database(e) => {
                tracing::error!("database error: {e}");
                json!({ "error": self.to_string() })
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return AppError::NotFound("Not found".into());
        }
        if let sqlx::Error::Database(db) = &err {
            let code = db.code().map(|c| c.into_owned());
            match code.as_deref() {
                Some("23505") => {
                    let (field, message) = unique_violation_field(db.constraint().unwrap_or_default());
                    return AppError::field(field, message);
                }
                Some("23503") => return AppError::BadRequest("Referenced record does not exist".into()),
                Some("23514") => return AppError::BadRequest("Value violates a check constraint".into()),
                _ => {}
            }
        }
        AppError::Database(err)
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        AppError::Internal(err.into())
    }
}

/// Maps a unique constraint or index name onto the request field it guards.
fn unique_violation_field(constraint: &str) -> (&'static str, &'static str) {
    match constraint {
        "uq_users_email" => ("email", "A user with this email already exists."),
        "uq_work_streams_name" => ("name", "A workstream with this name already exists."),
        "work_streams_slug_key" => ("slug", "A workstream with this slug already exists."),
        "uq_schools_name_per_work_stream" => ("school_name", "A school with this name already exists in the workstream."),
        "uq_academic_years_code" => ("academic_year_code", "This academic year already exists for the school."),
        "uq_grades_name" => ("name", "A grade with this name already exists for the school."),
        "uq_courses_code" => ("course_code", "A course with this code already exists for the school."),
        "uq_class_rooms_name" => ("classroom_name", "A classroom with this name already exists for the academic year."),
        "uq_student_enrollments_triple" => ("student_id", "The student is already enrolled in this classroom for the academic year."),
        "uq_course_allocations_triple" => ("course_id", "This course is already allocated to the classroom for the academic year."),
        "uq_marks_student_assignment" => ("student_id", "A mark already exists for this student and assignment."),
        "uq_attendance_student_allocation_date" => ("date", "Attendance is already recorded for this student on this date."),
        "guardian_student_links_guardian_id_student_id_key" => ("student_id", "The guardian is already linked to this student."),
        "uq_system_configurations_scope" => ("config_key", "This key is already configured for the scope."),
        "support_tickets_ticket_id_key" => ("ticket_id", "Ticket id already in use."),
        _ => ("non_field_errors", "Duplicate record."),
    }
}

/// Accumulates validation messages and converts into `AppError::Validation` when non-empty.
#[derive(Debug, Default)]
pub struct Validator {
    errors: FieldErrors,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: &str) -> &mut Self {
        if !ok {
            self.errors
                .entry(field.to_string())
                .or_default()
                .push(message.to_string());
        }
        self
    }

    pub fn require(&mut self, value: &str, field: &str) -> &mut Self {
        self.check(!value.trim().is_empty(), field, "This field is required.")
    }

    pub fn finish(&mut self) -> AppResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(std::mem::take(&mut self.errors)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(AppError::field("email", "bad").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Unauthorized("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::forbidden().status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::not_found("School").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::TooManyRequests.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn row_not_found_maps_to_404() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unique_constraints_map_to_fields() {
        assert_eq!(unique_violation_field("uq_users_email").0, "email");
        assert_eq!(unique_violation_field("uq_course_allocations_triple").0, "course_id");
        assert_eq!(unique_violation_field("something_else").0, "non_field_errors");
    }

    #[test]
    fn validator_collects_messages_per_field() {
        let mut v = Validator::new();
        v.require("  ", "full_name")
            .check(false, "capacity", "Must be at least 1.")
            .check(true, "email", "unused");
        match v.finish() {
            Err(AppError::Validation(fields)) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields["full_name"], vec!["This field is required.".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(Validator::new().finish().is_ok());
    }
}
