use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const NOTIFICATION_TYPES: [&str; 4] = ["system", "announcement", "alert", "message"];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub notification_type: String,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Who a notification fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationScope {
    User,
    School,
    Workstream,
}

impl NotificationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationScope::User => "user",
            NotificationScope::School => "school",
            NotificationScope::Workstream => "workstream",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendNotificationRequest {
    pub scope: NotificationScope,
    /// User, school or workstream id depending on `scope`.
    pub target_id: Uuid,
    pub title: String,
    pub body: String,
    pub notification_type: Option<String>,
    pub action_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationListQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
