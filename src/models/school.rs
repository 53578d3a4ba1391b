use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct School {
    pub id: Uuid,
    pub work_stream_id: Uuid,
    pub school_name: String,
    pub manager_id: Option<Uuid>,
    pub location: Option<String>,
    pub capacity: Option<i32>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A school together with the workstream it belongs to; the unit of every
/// school-level permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct SchoolRef {
    pub id: Uuid,
    pub work_stream_id: Uuid,
}

impl From<&School> for SchoolRef {
    fn from(s: &School) -> Self {
        Self {
            id: s.id,
            work_stream_id: s.work_stream_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchoolRequest {
    pub work_stream_id: Option<Uuid>,
    pub school_name: String,
    pub manager_id: Option<Uuid>,
    pub location: Option<String>,
    pub capacity: Option<i32>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSchoolRequest {
    pub work_stream_id: Option<Uuid>,
    pub school_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub manager_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "double_option")]
    pub location: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub capacity: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub contact_email: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub contact_phone: Option<Option<String>>,
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchoolListQuery {
    pub search: Option<String>,
    pub work_stream_id: Option<Uuid>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
