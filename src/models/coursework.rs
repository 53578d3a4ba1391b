use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{double_option, school::SchoolRef};

pub const EXAM_TYPES: [&str; 5] = ["assignment", "quiz", "midterm", "final", "project"];
pub const ATTENDANCE_STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];
pub const LESSON_PLAN_STATUSES: [&str; 2] = ["draft", "published"];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CourseAllocation {
    pub id: Uuid,
    pub course_id: Uuid,
    pub class_room_id: Uuid,
    pub teacher_id: Uuid,
    pub academic_year_id: Uuid,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Allocation with the school and workstream it lives in, used for permission checks.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct AllocationContext {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub class_room_id: Uuid,
    pub academic_year_id: Uuid,
    pub school_id: Uuid,
    pub work_stream_id: Uuid,
}

impl AllocationContext {
    pub fn school(&self) -> SchoolRef {
        SchoolRef {
            id: self.school_id,
            work_stream_id: self.work_stream_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAllocationRequest {
    pub course_id: Uuid,
    pub class_room_id: Uuid,
    pub teacher_id: Uuid,
    pub academic_year_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAllocationRequest {
    pub teacher_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub course_allocation_id: Uuid,
    pub created_by: Uuid,
    pub assignment_code: String,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub exam_type: String,
    pub full_mark: f64,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssignmentRequest {
    pub course_allocation_id: Uuid,
    pub assignment_code: String,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub exam_type: String,
    pub full_mark: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAssignmentRequest {
    pub assignment_code: Option<String>,
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<NaiveDate>>,
    pub exam_type: Option<String>,
    pub full_mark: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Mark {
    pub id: Uuid,
    pub student_id: Uuid,
    pub assignment_id: Uuid,
    pub score: f64,
    pub feedback: Option<String>,
    pub graded_by: Option<Uuid>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMarkRequest {
    pub student_id: Uuid,
    pub assignment_id: Uuid,
    pub score: f64,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMarkRequest {
    pub score: Option<f64>,
    #[serde(default, deserialize_with = "double_option")]
    pub feedback: Option<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkMarkEntry {
    pub student_id: Uuid,
    pub score: f64,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkMarksRequest {
    pub marks: Vec<BulkMarkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attendance {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_allocation_id: Uuid,
    pub date: NaiveDate,
    pub status: String,
    pub note: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAttendanceRequest {
    pub student_id: Uuid,
    pub course_allocation_id: Uuid,
    pub date: NaiveDate,
    pub status: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAttendanceRequest {
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub note: Option<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAttendanceEntry {
    pub student_id: Uuid,
    pub status: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAttendanceRequest {
    pub course_allocation_id: Uuid,
    pub date: NaiveDate,
    pub records: Vec<BulkAttendanceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LessonPlan {
    pub id: Uuid,
    pub course_allocation_id: Uuid,
    pub teacher_id: Uuid,
    pub title: String,
    pub objectives: Option<String>,
    pub content: Option<String>,
    pub plan_date: NaiveDate,
    pub status: String,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLessonPlanRequest {
    pub course_allocation_id: Uuid,
    pub title: String,
    pub objectives: Option<String>,
    pub content: Option<String>,
    pub plan_date: NaiveDate,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateLessonPlanRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub objectives: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub content: Option<Option<String>>,
    pub plan_date: Option<NaiveDate>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LearningMaterial {
    pub id: Uuid,
    pub course_allocation_id: Uuid,
    pub uploaded_by: Uuid,
    pub material_code: String,
    pub title: String,
    pub description: Option<String>,
    pub file_url: String,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLearningMaterialRequest {
    pub course_allocation_id: Uuid,
    pub material_code: String,
    pub title: String,
    pub description: Option<String>,
    pub file_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateLearningMaterialRequest {
    pub material_code: Option<String>,
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub file_url: Option<String>,
}

/// Filters shared by the coursework list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseworkListQuery {
    pub school_id: Option<Uuid>,
    pub course_allocation_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub class_room_id: Option<Uuid>,
    pub teacher_id: Option<Uuid>,
    pub academic_year_id: Option<Uuid>,
    pub assignment_id: Option<Uuid>,
    pub student_id: Option<Uuid>,
    pub status: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
