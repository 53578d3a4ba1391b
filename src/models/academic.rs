use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AcademicYear {
    pub id: Uuid,
    pub school_id: Uuid,
    pub academic_year_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_current: bool,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAcademicYearRequest {
    pub school_id: Uuid,
    pub academic_year_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAcademicYearRequest {
    pub academic_year_code: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_current: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Grade {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub numeric_level: i32,
    pub min_age: i32,
    pub max_age: i32,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGradeRequest {
    pub school_id: Uuid,
    pub name: String,
    pub numeric_level: i32,
    pub min_age: i32,
    pub max_age: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGradeRequest {
    pub name: Option<String>,
    pub numeric_level: Option<i32>,
    pub min_age: Option<i32>,
    pub max_age: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Course {
    pub id: Uuid,
    pub school_id: Uuid,
    pub grade_id: Uuid,
    pub course_code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCourseRequest {
    pub school_id: Uuid,
    pub grade_id: Uuid,
    pub course_code: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCourseRequest {
    pub grade_id: Option<Uuid>,
    pub course_code: Option<String>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClassRoom {
    pub id: Uuid,
    pub school_id: Uuid,
    pub academic_year_id: Uuid,
    pub grade_id: Uuid,
    pub classroom_name: String,
    pub capacity: Option<i32>,
    pub homeroom_teacher_id: Option<Uuid>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateClassRoomRequest {
    pub school_id: Uuid,
    pub academic_year_id: Uuid,
    pub grade_id: Uuid,
    pub classroom_name: String,
    pub capacity: Option<i32>,
    pub homeroom_teacher_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateClassRoomRequest {
    pub grade_id: Option<Uuid>,
    pub classroom_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub capacity: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub homeroom_teacher_id: Option<Option<Uuid>>,
}

/// Filters shared by the academic-structure list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcademicListQuery {
    pub school_id: Option<Uuid>,
    pub grade_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub search: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
