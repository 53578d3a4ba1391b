use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

pub const RELATIONSHIP_TYPES: [&str; 4] = ["parent", "guardian", "sibling", "other"];

/// Guardian profile joined with its user account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Guardian {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub school_id: Option<Uuid>,
    pub phone_number: Option<String>,
    pub occupation: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGuardianRequest {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub school_id: Option<Uuid>,
    pub phone_number: Option<String>,
    pub occupation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGuardianRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone_number: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub occupation: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GuardianStudentLink {
    pub id: Uuid,
    pub guardian_id: Uuid,
    pub student_id: Uuid,
    pub relationship_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkStudentRequest {
    pub student_id: Uuid,
    pub relationship_type: String,
}

/// A linked student as listed for a guardian.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LinkedStudent {
    pub student_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub school_id: Uuid,
    pub grade_id: Option<Uuid>,
    pub current_status: String,
    pub relationship_type: String,
}
