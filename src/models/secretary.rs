use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

/// Secretary profile joined with its user account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Secretary {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub school_id: Option<Uuid>,
    pub department: String,
    pub office_number: Option<String>,
    pub hire_date: NaiveDate,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSecretaryRequest {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub school_id: Uuid,
    pub department: String,
    pub office_number: Option<String>,
    pub hire_date: NaiveDate,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSecretaryRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    pub department: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub office_number: Option<Option<String>>,
    pub hire_date: Option<NaiveDate>,
}
