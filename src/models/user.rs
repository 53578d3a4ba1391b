use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    ManagerWorkstream,
    ManagerSchool,
    Teacher,
    Student,
    Guardian,
    Secretary,
    Guest,
}

impl UserRole {
    pub const ALL: [UserRole; 8] = [
        UserRole::Admin,
        UserRole::ManagerWorkstream,
        UserRole::ManagerSchool,
        UserRole::Teacher,
        UserRole::Student,
        UserRole::Guardian,
        UserRole::Secretary,
        UserRole::Guest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::ManagerWorkstream => "manager_workstream",
            UserRole::ManagerSchool => "manager_school",
            UserRole::Teacher => "teacher",
            UserRole::Student => "student",
            UserRole::Guardian => "guardian",
            UserRole::Secretary => "secretary",
            UserRole::Guest => "guest",
        }
    }

    pub fn is_manager(self) -> bool {
        matches!(self, UserRole::ManagerWorkstream | UserRole::ManagerSchool)
    }

    /// Everyone but students, guardians and guests.
    pub fn is_staff(self) -> bool {
        self == UserRole::Admin || self.is_manager() || self.is_school_staff()
    }

    /// Roles working inside a school (managers, teachers, secretaries).
    pub fn is_school_staff(self) -> bool {
        matches!(
            self,
            UserRole::ManagerSchool | UserRole::Teacher | UserRole::Secretary
        )
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown role: {s}"))
    }
}

/// DB row struct; role is stored as TEXT guarded by a CHECK constraint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<Uuid>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> UserRole {
        self.role.parse().unwrap_or(UserRole::Guest)
    }
}

/// Trimmed, lower-cased email used for every insert, update and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub role: UserRole,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    /// Take over the manager slot of the target workstream/school.
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    pub role: Option<UserRole>,
    #[serde(default, deserialize_with = "double_option")]
    pub work_stream_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "double_option")]
    pub school_id: Option<Option<Uuid>>,
    pub password: Option<String>,
    #[serde(default)]
    pub replace_manager: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub role: Option<UserRole>,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    pub is_active: Option<bool>,
    #[serde(default)]
    pub include_inactive: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip_through_text() {
        for role in UserRole::ALL {
            assert_eq!(role.as_str().parse::<UserRole>().unwrap(), role);
        }
        assert!("super_admin".parse::<UserRole>().is_err());
    }

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  Jane.Doe@School.ORG "), "jane.doe@school.org");
    }

    #[test]
    fn update_distinguishes_null_from_absent() {
        let req: UpdateUserRequest = serde_json::from_str(r#"{"school_id": null}"#).unwrap();
        assert_eq!(req.school_id, Some(None));
        assert_eq!(req.work_stream_id, None);
    }
}
