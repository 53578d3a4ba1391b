use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub thread_id: Uuid,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageReceipt {
    pub id: Uuid,
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

/// A received message as shown in the inbox.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct InboxItem {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// A sent message with its recipient count.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SentItem {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub recipient_count: i64,
    pub read_count: i64,
}

/// A message inside a thread view.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ThreadMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub recipient_ids: Vec<Uuid>,
    pub subject: Option<String>,
    pub body: String,
    /// Reply within an existing thread.
    pub thread_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageListQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
