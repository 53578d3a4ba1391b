use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::pagination::{Page, PageParams},
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        support::{
            CreateTicketRequest, SupportTicket, TicketCount, TicketListQuery, UpdateTicketRequest, TICKET_PRIORITIES,
            TICKET_STATUSES,
        },
    },
    services::rbac,
};

const TICKET_PREFIX: &str = "TKT-";
const MAX_ATTEMPTS: usize = 3;

/// Number of a `TKT-NNN` id, if it is one.
pub fn ticket_number(ticket_id: &str) -> Option<u32> {
    ticket_id.strip_prefix(TICKET_PREFIX)?.parse().ok()
}

/// Id following the highest number in use; three digits at least.
pub fn next_ticket_id(highest: Option<u32>) -> String {
    format!("{TICKET_PREFIX}{:03}", highest.unwrap_or(0) + 1)
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &TicketListQuery) {
    if !actor.is_admin() {
        qb.push(" AND t.created_by = ").push_bind(actor.id);
    }
    if let Some(status) = q.status.as_deref() {
        qb.push(" AND t.status = ").push_bind(status.to_string());
    }
    if let Some(priority) = q.priority.as_deref() {
        qb.push(" AND t.priority = ").push_bind(priority.to_string());
    }
}

pub struct SupportService;

impl SupportService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &TicketListQuery) -> AppResult<Page<SupportTicket>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM support_tickets t WHERE TRUE");
        push_filters(&mut count_qb, actor, q);
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT t.* FROM support_tickets t WHERE TRUE");
        push_filters(&mut qb, actor, q);
        qb.push(" ORDER BY t.created_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<SupportTicket>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<SupportTicket> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT t.* FROM support_tickets t WHERE t.id = ");
        qb.push_bind(id);
        push_filters(&mut qb, actor, &TicketListQuery::default());
        qb.build_query_as::<SupportTicket>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Ticket"))
    }

    /// Opens a ticket under the next free `TKT-NNN` id. Two concurrent
    /// openings may race for the same id; the loser retries.
    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateTicketRequest) -> AppResult<SupportTicket> {
        let priority = req.priority.unwrap_or_else(|| "medium".to_string());
        Validator::new()
            .require(&req.subject, "subject")
            .require(&req.description, "description")
            .check(TICKET_PRIORITIES.contains(&priority.as_str()), "priority", "Select a valid priority.")
            .finish()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let ids: Vec<String> = sqlx::query_scalar("SELECT ticket_id FROM support_tickets WHERE ticket_id LIKE 'TKT-%'")
                .fetch_all(pool)
                .await?;
            let ticket_id = next_ticket_id(ids.iter().filter_map(|id| ticket_number(id)).max());

            let inserted = sqlx::query_as::<_, SupportTicket>(
                "INSERT INTO support_tickets (ticket_id, subject, description, priority, created_by)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING *",
            )
            .bind(&ticket_id)
            .bind(req.subject.trim())
            .bind(req.description.trim())
            .bind(&priority)
            .bind(actor.id)
            .fetch_one(pool)
            .await;

            match inserted {
                Ok(ticket) => {
                    tracing::info!("support ticket {} opened by {}", ticket.ticket_id, actor.id);
                    return Ok(ticket);
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() && attempt < MAX_ATTEMPTS => {
                    tracing::debug!("ticket id {ticket_id} taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Admins triage every field; a reporter may only reword its own open ticket.
    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateTicketRequest) -> AppResult<SupportTicket> {
        let current = Self::get(pool, actor, id).await?;
        let mut v = Validator::new();
        if let Some(subject) = req.subject.as_deref() {
            v.require(subject, "subject");
        }
        if let Some(description) = req.description.as_deref() {
            v.require(description, "description");
        }
        if let Some(priority) = req.priority.as_deref() {
            v.check(TICKET_PRIORITIES.contains(&priority), "priority", "Select a valid priority.");
        }
        if let Some(status) = req.status.as_deref() {
            v.check(TICKET_STATUSES.contains(&status), "status", "Select a valid status.");
        }
        v.finish()?;

        if !actor.is_admin() {
            rbac::ensure(req.status.is_none() && req.assigned_to.is_none() && current.status == "open")?;
        }

        let ticket = sqlx::query_as::<_, SupportTicket>(
            "UPDATE support_tickets
             SET subject = COALESCE($2, subject),
                 description = COALESCE($3, description),
                 priority = COALESCE($4, priority),
                 status = COALESCE($5, status),
                 assigned_to = CASE WHEN $6 THEN $7 ELSE assigned_to END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.subject.as_deref().map(str::trim))
        .bind(req.description.as_deref().map(str::trim))
        .bind(req.priority)
        .bind(req.status)
        .bind(req.assigned_to.is_some())
        .bind(req.assigned_to.flatten())
        .fetch_one(pool)
        .await?;
        Ok(ticket)
    }

    pub async fn delete(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        rbac::require_admin(actor)?;
        let res = sqlx::query("DELETE FROM support_tickets WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("Ticket"));
        }
        Ok(())
    }

    /// Counts by status and by priority over the tickets the actor can see.
    pub async fn stats(pool: &PgPool, actor: &Actor) -> AppResult<Value> {
        let mut out = serde_json::Map::new();
        let mut total = 0;
        for column in ["status", "priority"] {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT t.{column} AS key, COUNT(*) AS count FROM support_tickets t WHERE TRUE"
            ));
            push_filters(&mut qb, actor, &TicketListQuery::default());
            qb.push(format!(" GROUP BY t.{column} ORDER BY t.{column}"));
            let rows = qb.build_query_as::<TicketCount>().fetch_all(pool).await?;
            total = rows.iter().map(|r| r.count).sum::<i64>();
            let keys: &[&str] = if column == "status" { &TICKET_STATUSES } else { &TICKET_PRIORITIES };
            out.insert(format!("by_{column}"), zero_filled(keys, &rows));
        }
        out.insert("total".into(), json!(total));
        Ok(Value::Object(out))
    }
}

/// Every known key with its count, missing ones as 0.
fn zero_filled(keys: &[&str], rows: &[TicketCount]) -> Value {
    let map: serde_json::Map<String, Value> = keys
        .iter()
        .map(|k| {
            let n = rows.iter().find(|r| r.key == *k).map_or(0, |r| r.count);
            (k.to_string(), json!(n))
        })
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_numbering() {
        assert_eq!(next_ticket_id(None), "TKT-001");
        assert_eq!(next_ticket_id(Some(41)), "TKT-042");
        assert_eq!(next_ticket_id(Some(999)), "TKT-1000");
        assert_eq!(ticket_number("TKT-017"), Some(17));
        assert_eq!(ticket_number("TKT-x"), None);
        assert_eq!(ticket_number("BUG-3"), None);
    }

    #[test]
    fn highest_number_wins_over_lexical_order() {
        let ids = ["TKT-009", "TKT-1000", "TKT-999"];
        let next = next_ticket_id(ids.iter().filter_map(|id| ticket_number(id)).max());
        assert_eq!(next, "TKT-1001");
    }

    #[test]
    fn stats_are_zero_filled() {
        let rows = vec![TicketCount {
            key: "open".into(),
            count: 3,
        }];
        let v = zero_filled(&TICKET_STATUSES, &rows);
        assert_eq!(v["open"], 3);
        assert_eq!(v["closed"], 0);
        assert_eq!(v["in_progress"], 0);
    }
}
