use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkStream {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub manager_id: Option<Uuid>,
    pub capacity: i32,
    pub location: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkStreamRequest {
    pub name: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub manager_id: Option<Uuid>,
    pub capacity: i32,
    pub location: Option<String>,
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateWorkStreamRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub capacity: Option<i32>,
    #[serde(default, deserialize_with = "double_option")]
    pub location: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub manager_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkStreamListQuery {
    pub search: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// Public information shown on a workstream's login page.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WorkStreamInfo {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub school_count: i64,
}
