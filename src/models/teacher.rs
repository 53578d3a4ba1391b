use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

pub const EMPLOYMENT_STATUSES: [&str; 4] = ["full_time", "part_time", "contract", "substitute"];

/// Teacher profile joined with its user account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Teacher {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub school_id: Option<Uuid>,
    pub work_stream_id: Option<Uuid>,
    pub specialization: Option<String>,
    pub hire_date: NaiveDate,
    pub employment_status: String,
    pub highest_degree: Option<String>,
    pub years_of_experience: Option<i32>,
    pub office_location: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTeacherRequest {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub school_id: Uuid,
    pub specialization: Option<String>,
    pub hire_date: NaiveDate,
    pub employment_status: String,
    pub highest_degree: Option<String>,
    pub years_of_experience: Option<i32>,
    pub office_location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTeacherRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub specialization: Option<Option<String>>,
    pub hire_date: Option<NaiveDate>,
    pub employment_status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub highest_degree: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub years_of_experience: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub office_location: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileListQuery {
    pub school_id: Option<Uuid>,
    pub search: Option<String>,
    pub status: Option<String>,
    pub grade_id: Option<Uuid>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
