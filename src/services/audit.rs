use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        scope::{Scope, ScopeColumns},
    },
    errors::{AppError, AppResult},
    models::{
        activity::{ActionType, ActivityListQuery, ActivityLog},
        auth::{Actor, ClientInfo},
    },
};

/// An activity log entry to record.
pub struct AuditEntry {
    pub actor_id: Option<Uuid>,
    pub action: ActionType,
    pub entity_type: &'static str,
    pub entity_id: Option<String>,
    pub description: String,
    pub ip_address: Option<String>,
}

impl AuditEntry {
    pub fn new(actor: &Actor, action: ActionType, entity_type: &'static str, entity_id: impl ToString) -> Self {
        Self {
            actor_id: Some(actor.id),
            action,
            entity_type,
            entity_id: Some(entity_id.to_string()),
            description: format!("{} {} {}", actor.email, action.as_str(), entity_type),
            ip_address: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn from_client(mut self, client: &ClientInfo) -> Self {
        self.ip_address = client.ip_address.clone();
        self
    }
}

/// Fire-and-forget activity log entry.
/// Spawns a background task, never blocks the request handler and
/// never propagates errors (logs a warning on failure).
pub fn log(pool: PgPool, entry: AuditEntry) {
    tokio::spawn(async move {
        let res = sqlx::query(
            "INSERT INTO activity_logs
                (actor_id, action_type, entity_type, entity_id, description, ip_address)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.actor_id)
        .bind(entry.action.as_str())
        .bind(entry.entity_type)
        .bind(entry.entity_id)
        .bind(&entry.description)
        .bind(entry.ip_address)
        .execute(&pool)
        .await;

        if let Err(e) = res {
            tracing::warn!("activity log insert failed ({}): {e}", entry.description);
        }
    });
}

/// Records a successful login in the background: login history row,
/// `last_login_at` and a `login` activity entry.
pub fn record_login(pool: PgPool, user_id: Uuid, client: ClientInfo) {
    tokio::spawn(async move {
        let res: Result<(), sqlx::Error> = async {
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT INTO user_login_history (user_id, ip_address, user_agent) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(&client.ip_address)
                .bind(&client.user_agent)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO activity_logs (actor_id, action_type, entity_type, entity_id, description, ip_address)
                 VALUES ($1, 'login', 'user', $2, 'User logged in', $3)",
            )
            .bind(user_id)
            .bind(user_id.to_string())
            .bind(&client.ip_address)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = res {
            tracing::warn!("login history insert failed for {user_id}: {e}");
        }
    });
}

/// Activity log listing: admin sees everything, managers see entries of
/// actors inside their organisation.
pub async fn list(pool: &PgPool, actor: &Actor, q: &ActivityListQuery) -> AppResult<Page<ActivityLog>> {
    let scope = Scope::for_actor(actor)?;
    if !matches!(scope, Scope::All) && !actor.role.is_manager() {
        return Err(AppError::forbidden());
    }
    let params = PageParams::new(q.page, q.page_size);

    let build = |select: &str| {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(select);
        qb.push(" FROM activity_logs a LEFT JOIN users u ON u.id = a.actor_id WHERE TRUE");
        scope.push_filter(
            &mut qb,
            &ScopeColumns {
                work_stream: Some("u.work_stream_id"),
                ..ScopeColumns::school("u.school_id")
            },
        );
        if let Some(action) = q.action_type {
            qb.push(" AND a.action_type = ").push_bind(action.as_str());
        }
        if let Some(entity) = q.entity_type.as_deref() {
            qb.push(" AND a.entity_type = ").push_bind(entity.to_string());
        }
        if let Some(actor_id) = q.actor_id {
            qb.push(" AND a.actor_id = ").push_bind(actor_id);
        }
        qb
    };

    let count: i64 = build("SELECT COUNT(*)").build_query_scalar().fetch_one(pool).await?;

    let mut qb = build("SELECT a.*, u.full_name AS actor_name");
    qb.push(" ORDER BY a.created_at DESC");
    params.push_limit(&mut qb);
    let rows = qb.build_query_as::<ActivityLog>().fetch_all(pool).await?;

    Ok(params.wrap(count, rows))
}
