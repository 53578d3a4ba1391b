use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::pagination::{Page, PageParams},
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        notification::{Notification, NotificationListQuery, NotificationScope, SendNotificationRequest, NOTIFICATION_TYPES},
    },
    services::{messages::push_reachable, metrics::NOTIFICATIONS_COUNTER, rbac, schools::SchoolService},
};

fn validate(req: &SendNotificationRequest) -> AppResult<()> {
    let mut v = Validator::new();
    v.require(&req.title, "title").require(&req.body, "body");
    v.check(
        req.title.chars().count() <= 150,
        "title",
        "Ensure this field has no more than 150 characters.",
    );
    if let Some(kind) = req.notification_type.as_deref() {
        v.check(NOTIFICATION_TYPES.contains(&kind), "notification_type", "Select a valid notification type.");
    }
    v.finish()
}

pub struct NotificationService;

impl NotificationService {
    /// Fans a notification out to a user, every active member of a school, or
    /// every active member of a workstream. Returns the number delivered.
    pub async fn send(pool: &PgPool, actor: &Actor, req: SendNotificationRequest) -> AppResult<u64> {
        validate(&req)?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO notifications (recipient_id, sender_id, title, body, notification_type, action_url)
             SELECT u.id, ",
        );
        qb.push_bind(actor.id)
            .push(", ")
            .push_bind(req.title.trim().to_string())
            .push(", ")
            .push_bind(req.body.trim().to_string())
            .push(", ")
            .push_bind(req.notification_type.clone().unwrap_or_else(|| "announcement".to_string()))
            .push(", ")
            .push_bind(req.action_url.clone())
            .push(" FROM users u WHERE u.is_active");

        match req.scope {
            NotificationScope::User => {
                let mut check = QueryBuilder::<Postgres>::new("SELECT EXISTS(SELECT 1 FROM users u WHERE u.is_active AND u.id = ");
                check.push_bind(req.target_id);
                push_reachable(&mut check, actor)?;
                check.push(")");
                let reachable: bool = check.build_query_scalar().fetch_one(pool).await?;
                if !reachable {
                    return Err(AppError::not_found("User"));
                }
                qb.push(" AND u.id = ").push_bind(req.target_id);
            }
            NotificationScope::School => {
                let school = SchoolService::require_ref(pool, req.target_id, "target_id").await?;
                rbac::ensure(rbac::can_administer_school(actor, school))?;
                qb.push(" AND u.school_id = ")
                    .push_bind(school.id)
                    .push(" AND u.id <> ")
                    .push_bind(actor.id);
            }
            NotificationScope::Workstream => {
                rbac::ensure(rbac::can_manage_workstream(actor, req.target_id))?;
                let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM work_streams WHERE id = $1")
                    .bind(req.target_id)
                    .fetch_optional(pool)
                    .await?;
                if active != Some(true) {
                    return Err(AppError::field("target_id", "Select a valid, active workstream."));
                }
                qb.push(" AND (u.work_stream_id = ")
                    .push_bind(req.target_id)
                    .push(" OR u.school_id IN (SELECT id FROM schools WHERE work_stream_id = ")
                    .push_bind(req.target_id)
                    .push(")) AND u.id <> ")
                    .push_bind(actor.id);
            }
        }

        let delivered = qb.build().execute(pool).await?.rows_affected();
        NOTIFICATIONS_COUNTER
            .with_label_values(&[req.scope.as_str()])
            .inc_by(delivered as f64);
        tracing::info!(
            "notification '{}' sent by {} to {} recipients ({})",
            req.title.trim(),
            actor.id,
            delivered,
            req.scope.as_str()
        );
        Ok(delivered)
    }

    pub async fn list(pool: &PgPool, user_id: Uuid, q: &NotificationListQuery) -> AppResult<Page<Notification>> {
        let page = PageParams::new(q.page, q.page_size);
        let unread = if q.unread_only { " AND NOT is_read" } else { "" };

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = $1{unread}"
        ))
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM notifications WHERE recipient_id = ");
        qb.push_bind(user_id).push(unread).push(" ORDER BY created_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<Notification>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn unread_count(pool: &PgPool, user_id: Uuid) -> AppResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE recipient_id = $1 AND NOT is_read")
                .bind(user_id)
                .fetch_one(pool)
                .await?,
        )
    }

    pub async fn mark_read(pool: &PgPool, user_id: Uuid, id: Uuid) -> AppResult<Notification> {
        sqlx::query_as::<_, Notification>(
            "UPDATE notifications SET is_read = TRUE, read_at = COALESCE(read_at, NOW())
             WHERE id = $1 AND recipient_id = $2
             RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Notification"))
    }

    pub async fn mark_all_read(pool: &PgPool, user_id: Uuid) -> AppResult<u64> {
        let res = sqlx::query(
            "UPDATE notifications SET is_read = TRUE, read_at = NOW() WHERE recipient_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .execute(pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn delete(pool: &PgPool, user_id: Uuid, id: Uuid) -> AppResult<()> {
        let res = sqlx::query("DELETE FROM notifications WHERE id = $1 AND recipient_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("Notification"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: &str, kind: Option<&str>) -> SendNotificationRequest {
        SendNotificationRequest {
            scope: NotificationScope::School,
            target_id: Uuid::new_v4(),
            title: title.into(),
            body: "Body".into(),
            notification_type: kind.map(Into::into),
            action_url: None,
        }
    }

    #[test]
    fn validation() {
        assert!(validate(&request("Closure", None)).is_ok());
        assert!(validate(&request("Closure", Some("alert"))).is_ok());
        assert!(validate(&request("Closure", Some("spam"))).is_err());
        assert!(validate(&request(" ", None)).is_err());
        assert!(validate(&request(&"x".repeat(151), None)).is_err());
    }

    #[test]
    fn scope_labels() {
        assert_eq!(NotificationScope::Workstream.as_str(), "workstream");
    }
}
