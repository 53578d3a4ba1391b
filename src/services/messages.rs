use std::collections::BTreeSet;

use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        soft_delete::{self, SoftDeletable},
    },
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        message::{InboxItem, Message, MessageListQuery, SendMessageRequest, SentItem, ThreadMessage},
        user::UserRole,
    },
    services::metrics::MESSAGES_COUNTER,
};

const STAFF_ROLES: &str = "('manager_school', 'teacher', 'secretary')";

/// Restricts `users u` to the accounts the actor may address. Staff reach
/// their school and the guardians of its students; students and guardians
/// reach the staff of their (children's) schools.
pub fn push_reachable(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor) -> AppResult<()> {
    match actor.role {
        UserRole::Admin => {}
        UserRole::ManagerWorkstream => match actor.work_stream_id {
            Some(ws) => {
                qb.push(" AND (u.work_stream_id = ")
                    .push_bind(ws)
                    .push(" OR u.school_id IN (SELECT id FROM schools WHERE work_stream_id = ")
                    .push_bind(ws)
                    .push(") OR u.role = 'admin')");
            }
            None => {
                qb.push(" AND u.role = 'admin'");
            }
        },
        UserRole::ManagerSchool | UserRole::Teacher | UserRole::Secretary => match actor.school_id {
            Some(school) => {
                qb.push(" AND (u.school_id = ")
                    .push_bind(school)
                    .push(
                        " OR u.id IN (SELECT l.guardian_id FROM guardian_student_links l
                           JOIN students st ON st.user_id = l.student_id WHERE st.school_id = ",
                    )
                    .push_bind(school)
                    .push(")")
                    .push(" OR u.id = (SELECT w.manager_id FROM work_streams w JOIN schools s ON s.work_stream_id = w.id WHERE s.id = ")
                    .push_bind(school)
                    .push("))");
            }
            None => {
                qb.push(" AND FALSE");
            }
        },
        UserRole::Student => {
            qb.push(format!(
                " AND u.role IN {STAFF_ROLES} AND u.school_id = (SELECT school_id FROM students WHERE user_id = "
            ))
            .push_bind(actor.id)
            .push(")");
        }
        UserRole::Guardian => {
            qb.push(format!(
                " AND u.role IN {STAFF_ROLES} AND u.school_id IN (SELECT st.school_id FROM guardian_student_links l
                   JOIN students st ON st.user_id = l.student_id WHERE l.guardian_id = "
            ))
            .push_bind(actor.id)
            .push(")");
        }
        UserRole::Guest => return Err(AppError::forbidden()),
    }
    Ok(())
}

/// Distinct recipients, or `None` when the list is empty or names the sender.
pub fn normalize_recipients(sender: Uuid, ids: &[Uuid]) -> Option<Vec<Uuid>> {
    let set: BTreeSet<Uuid> = ids.iter().copied().collect();
    if set.is_empty() || set.contains(&sender) {
        return None;
    }
    Some(set.into_iter().collect())
}

fn push_inbox_filters(qb: &mut QueryBuilder<'_, Postgres>, user_id: Uuid, unread_only: bool) {
    qb.push(" WHERE r.recipient_id = ")
        .push_bind(user_id)
        .push(" AND NOT r.is_deleted AND m.is_active");
    if unread_only {
        qb.push(" AND NOT r.is_read");
    }
}

pub struct MessageService;

impl MessageService {
    /// Sends a message to every recipient, opening a new thread unless the
    /// sender replies within one it takes part in.
    pub async fn send(pool: &PgPool, actor: &Actor, req: SendMessageRequest) -> AppResult<Message> {
        let recipients = normalize_recipients(actor.id, &req.recipient_ids);
        Validator::new()
            .require(&req.body, "body")
            .check(
                recipients.is_some(),
                "recipient_ids",
                "Select at least one recipient other than yourself.",
            )
            .check(
                req.subject.as_deref().map_or(true, |s| s.chars().count() <= 150),
                "subject",
                "Ensure this field has no more than 150 characters.",
            )
            .finish()?;
        let recipients = recipients.unwrap_or_default();

        let mut tx = pool.begin().await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users u WHERE u.is_active AND u.id = ANY(");
        qb.push_bind(recipients.clone()).push(")");
        push_reachable(&mut qb, actor)?;
        let reachable: i64 = qb.build_query_scalar().fetch_one(&mut *tx).await?;
        if reachable != recipients.len() as i64 {
            return Err(AppError::field("recipient_ids", "One or more recipients cannot be messaged."));
        }

        let thread_id = match req.thread_id {
            Some(thread) => {
                let member: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM messages m
                                   LEFT JOIN message_receipts r ON r.message_id = m.id AND r.recipient_id = $2
                                   WHERE m.thread_id = $1 AND (m.sender_id = $2 OR r.id IS NOT NULL))",
                )
                .bind(thread)
                .bind(actor.id)
                .fetch_one(&mut *tx)
                .await?;
                if !member {
                    return Err(AppError::not_found("Thread"));
                }
                thread
            }
            None => Uuid::new_v4(),
        };

        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (sender_id, thread_id, subject, body)
             VALUES ($1, $2, $3, $4)
             RETURNING id, sender_id, thread_id, subject, body, sent_at, is_active",
        )
        .bind(actor.id)
        .bind(thread_id)
        .bind(req.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .bind(req.body.trim())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO message_receipts (message_id, recipient_id)
             SELECT $1, r FROM UNNEST($2::uuid[]) AS r",
        )
        .bind(message.id)
        .bind(&recipients)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO notifications (recipient_id, sender_id, title, body, notification_type, action_url)
             SELECT r, $1, $2, $3, 'message', $4 FROM UNNEST($5::uuid[]) AS r",
        )
        .bind(actor.id)
        .bind(format!("New message from {}", actor.full_name))
        .bind(message.subject.clone().unwrap_or_else(|| "(no subject)".to_string()))
        .bind(format!("/messages/threads/{thread_id}"))
        .bind(&recipients)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        MESSAGES_COUNTER.inc();
        tracing::info!("message {} sent by {} to {} recipients", message.id, actor.id, recipients.len());
        Ok(message)
    }

    pub async fn inbox(pool: &PgPool, user_id: Uuid, q: &MessageListQuery) -> AppResult<Page<InboxItem>> {
        let page = PageParams::new(q.page, q.page_size);
        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM message_receipts r JOIN messages m ON m.id = r.message_id",
        );
        push_inbox_filters(&mut count_qb, user_id, q.unread_only);
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT m.id AS message_id, m.thread_id, m.sender_id, s.full_name AS sender_name,
                    m.subject, m.body, m.sent_at, r.is_read, r.read_at
             FROM message_receipts r
             JOIN messages m ON m.id = r.message_id
             JOIN users s ON s.id = m.sender_id",
        );
        push_inbox_filters(&mut qb, user_id, q.unread_only);
        qb.push(" ORDER BY m.sent_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<InboxItem>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn sent(pool: &PgPool, user_id: Uuid, q: &MessageListQuery) -> AppResult<Page<SentItem>> {
        let page = PageParams::new(q.page, q.page_size);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE sender_id = $1 AND is_active")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT m.id AS message_id, m.thread_id, m.subject, m.body, m.sent_at,
                    (SELECT COUNT(*) FROM message_receipts r WHERE r.message_id = m.id) AS recipient_count,
                    (SELECT COUNT(*) FROM message_receipts r WHERE r.message_id = m.id AND r.is_read) AS read_count
             FROM messages m
             WHERE m.is_active AND m.sender_id = ",
        );
        qb.push_bind(user_id);
        qb.push(" ORDER BY m.sent_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<SentItem>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn unread_count(pool: &PgPool, user_id: Uuid) -> AppResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM message_receipts r JOIN messages m ON m.id = r.message_id
             WHERE r.recipient_id = $1 AND NOT r.is_read AND NOT r.is_deleted AND m.is_active",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?)
    }

    /// Messages of a thread the user sent or received, oldest first.
    pub async fn thread(pool: &PgPool, user_id: Uuid, thread_id: Uuid) -> AppResult<Vec<ThreadMessage>> {
        let rows = sqlx::query_as::<_, ThreadMessage>(
            "SELECT m.id, m.sender_id, s.full_name AS sender_name, m.subject, m.body, m.sent_at
             FROM messages m
             JOIN users s ON s.id = m.sender_id
             WHERE m.thread_id = $1 AND m.is_active
               AND (m.sender_id = $2 OR EXISTS(
                    SELECT 1 FROM message_receipts r
                    WHERE r.message_id = m.id AND r.recipient_id = $2 AND NOT r.is_deleted))
             ORDER BY m.sent_at",
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        if rows.is_empty() {
            return Err(AppError::not_found("Thread"));
        }
        Ok(rows)
    }

    pub async fn mark_read(pool: &PgPool, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        let res = sqlx::query(
            "UPDATE message_receipts SET is_read = TRUE, read_at = COALESCE(read_at, NOW())
             WHERE message_id = $1 AND recipient_id = $2 AND NOT is_deleted",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("Message"));
        }
        Ok(())
    }

    pub async fn mark_thread_read(pool: &PgPool, user_id: Uuid, thread_id: Uuid) -> AppResult<u64> {
        let res = sqlx::query(
            "UPDATE message_receipts r SET is_read = TRUE, read_at = NOW()
             FROM messages m
             WHERE m.id = r.message_id AND m.thread_id = $1 AND r.recipient_id = $2 AND NOT r.is_read",
        )
        .bind(thread_id)
        .bind(user_id)
        .execute(pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// The sender retracts the message for everyone; a recipient only hides
    /// its own copy.
    pub async fn delete(pool: &PgPool, actor: &Actor, message_id: Uuid) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let sender: Option<Uuid> = sqlx::query_scalar("SELECT sender_id FROM messages WHERE id = $1 AND is_active")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        match sender {
            Some(sender) if sender == actor.id => {
                soft_delete::deactivate(&mut tx, SoftDeletable::Message, message_id, actor.id).await?;
            }
            Some(_) => {
                let res = sqlx::query(
                    "UPDATE message_receipts SET is_deleted = TRUE
                     WHERE message_id = $1 AND recipient_id = $2 AND NOT is_deleted",
                )
                .bind(message_id)
                .bind(actor.id)
                .execute(&mut *tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(AppError::not_found("Message"));
                }
            }
            None => return Err(AppError::not_found("Message")),
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role,
            work_stream_id: Some(Uuid::new_v4()),
            school_id: Some(Uuid::new_v4()),
        }
    }

    fn render(actor: &Actor) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM users u WHERE TRUE");
        push_reachable(&mut qb, actor).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn recipients_are_deduplicated() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert_eq!(normalize_recipients(me, &[other, other]), Some(vec![other]));
        assert_eq!(normalize_recipients(me, &[]), None);
        assert_eq!(normalize_recipients(me, &[other, me]), None);
    }

    #[test]
    fn students_reach_staff_of_their_school() {
        let sql = render(&actor(UserRole::Student));
        assert!(sql.contains("u.role IN ('manager_school', 'teacher', 'secretary')"));
        assert!(sql.contains("FROM students WHERE user_id = $1"));
    }

    #[test]
    fn teachers_reach_guardians_of_their_students() {
        let sql = render(&actor(UserRole::Teacher));
        assert!(sql.contains("u.school_id = $1"));
        assert!(sql.contains("guardian_student_links"));
    }

    #[test]
    fn guests_cannot_message() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        assert!(push_reachable(&mut qb, &actor(UserRole::Guest)).is_err());
    }
}
