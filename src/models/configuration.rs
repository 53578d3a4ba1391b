use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemConfiguration {
    pub id: Uuid,
    pub config_key: String,
    pub config_value: String,
    pub description: Option<String>,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    pub is_active: bool,
    pub updated_by: Option<Uuid>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLevel {
    School,
    WorkStream,
    Global,
}

impl SystemConfiguration {
    pub fn level(&self) -> ConfigLevel {
        match (self.school_id, self.work_stream_id) {
            (Some(_), _) => ConfigLevel::School,
            (None, Some(_)) => ConfigLevel::WorkStream,
            (None, None) => ConfigLevel::Global,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConfigurationRequest {
    pub config_key: String,
    pub config_value: String,
    pub description: Option<String>,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConfigurationRequest {
    pub config_value: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigurationListQuery {
    pub config_key: Option<String>,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveConfigurationQuery {
    pub key: String,
    pub school_id: Option<Uuid>,
    pub work_stream_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfiguration {
    pub key: String,
    pub value: Option<String>,
    pub level: Option<ConfigLevel>,
    pub configuration_id: Option<Uuid>,
}
