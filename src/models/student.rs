use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

pub const STUDENT_STATUSES: [&str; 5] = ["active", "inactive", "graduated", "transferred", "suspended"];
pub const ENROLLMENT_STATUSES: [&str; 4] = ["enrolled", "completed", "withdrawn", "transferred"];

/// Student profile joined with its user account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub school_id: Uuid,
    pub grade_id: Option<Uuid>,
    pub date_of_birth: NaiveDate,
    pub admission_date: NaiveDate,
    pub current_status: String,
    pub address: Option<String>,
    pub medical_notes: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateStudentRequest {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub school_id: Uuid,
    pub grade_id: Option<Uuid>,
    pub date_of_birth: NaiveDate,
    pub admission_date: Option<NaiveDate>,
    pub address: Option<String>,
    pub medical_notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStudentRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub grade_id: Option<Option<Uuid>>,
    pub date_of_birth: Option<NaiveDate>,
    pub admission_date: Option<NaiveDate>,
    pub current_status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub medical_notes: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StudentEnrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub class_room_id: Uuid,
    pub academic_year_id: Uuid,
    pub status: String,
    pub enrolled_at: NaiveDate,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEnrollmentRequest {
    pub student_id: Uuid,
    pub class_room_id: Uuid,
    pub academic_year_id: Uuid,
    pub enrolled_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEnrollmentRequest {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrollmentListQuery {
    pub student_id: Option<Uuid>,
    pub class_room_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
