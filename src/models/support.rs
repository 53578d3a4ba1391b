use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::double_option;

pub const TICKET_PRIORITIES: [&str; 3] = ["low", "medium", "high"];
pub const TICKET_STATUSES: [&str; 3] = ["open", "in_progress", "closed"];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SupportTicket {
    pub id: Uuid,
    pub ticket_id: String,
    pub subject: String,
    pub description: String,
    pub priority: String,
    pub status: String,
    pub created_by: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub description: String,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTicketRequest {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub assigned_to: Option<Option<Uuid>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketListQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StaffEvaluation {
    pub id: Uuid,
    pub evaluator_id: Uuid,
    pub teacher_id: Uuid,
    pub school_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub score: f64,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEvaluationRequest {
    pub teacher_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub score: f64,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluationListQuery {
    pub teacher_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEvaluationRequest {
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub score: Option<f64>,
    #[serde(default, deserialize_with = "double_option")]
    pub comments: Option<Option<String>>,
}

/// Ticket counts grouped by one column.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TicketCount {
    pub key: String,
    pub count: i64,
}
