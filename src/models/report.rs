use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Attendance records by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct AttendanceSummary {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RoleCount {
    pub role: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SchoolCounts {
    pub school_id: Uuid,
    pub school_name: String,
    pub students: i64,
    pub teachers: i64,
    pub class_rooms: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct GradeCounts {
    pub grade_id: Uuid,
    pub name: String,
    pub numeric_level: i32,
    pub students: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ClassRoomCounts {
    pub class_room_id: Uuid,
    pub classroom_name: String,
    pub capacity: Option<i32>,
    pub enrolled: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AllocationCounts {
    pub course_allocation_id: Uuid,
    pub course_name: String,
    pub classroom_name: String,
    pub enrolled: i64,
    pub assignments: i64,
}

/// Mark average of one course, as a percentage of full marks.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CourseAverage {
    pub course_id: Uuid,
    pub name: String,
    pub marks: i64,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginActivityQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportEntity {
    Users,
    Students,
    Teachers,
    Schools,
    Enrollments,
    Marks,
    Attendance,
}

impl ExportEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportEntity::Users => "users",
            ExportEntity::Students => "students",
            ExportEntity::Teachers => "teachers",
            ExportEntity::Schools => "schools",
            ExportEntity::Enrollments => "enrollments",
            ExportEntity::Marks => "marks",
            ExportEntity::Attendance => "attendance",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(self) -> mime::Mime {
        match self {
            ExportFormat::Csv => mime::TEXT_CSV_UTF_8,
            ExportFormat::Json => mime::APPLICATION_JSON,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportQuery {
    pub entity: ExportEntity,
    #[serde(default)]
    pub format: ExportFormat,
}
