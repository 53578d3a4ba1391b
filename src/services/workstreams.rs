use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        soft_delete::{self, SoftDeletable},
    },
    errors::{AppError, AppResult, Validator},
    middleware::workstream::{is_valid_slug, slugify},
    models::{
        auth::Actor,
        user::UserRole,
        workstream::{CreateWorkStreamRequest, UpdateWorkStreamRequest, WorkStream, WorkStreamInfo, WorkStreamListQuery},
    },
    services::{
        rbac,
        users::{assign_manager, ManagedUnit},
    },
};

/// Workstream visible to the actor: admin all, managers their own.
fn visible_workstream(actor: &Actor) -> AppResult<Option<Uuid>> {
    match actor.role {
        UserRole::Admin => Ok(None),
        UserRole::ManagerWorkstream | UserRole::ManagerSchool => {
            actor.work_stream_id.map(Some).ok_or_else(AppError::forbidden)
        }
        _ => Err(AppError::forbidden()),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &WorkStreamListQuery) -> AppResult<()> {
    if let Some(ws) = visible_workstream(actor)? {
        qb.push(" AND w.id = ").push_bind(ws);
    }
    if !(q.include_inactive && actor.is_admin()) {
        qb.push(" AND w.is_active");
    }
    if let Some(search) = q.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        qb.push(" AND (w.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR w.slug ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    Ok(())
}

/// Points a workstream manager's account at the workstream it now manages.
async fn link_manager(conn: &mut PgConnection, ws: Uuid, manager_id: Uuid, replace: bool) -> AppResult<()> {
    let role: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1 AND is_active")
        .bind(manager_id)
        .fetch_optional(&mut *conn)
        .await?;
    if role.as_deref() != Some(UserRole::ManagerWorkstream.as_str()) {
        return Err(AppError::field(
            "manager_id",
            "The manager must be an active user with the workstream manager role.",
        ));
    }
    assign_manager(&mut *conn, ManagedUnit::WorkStream, ws, manager_id, replace).await?;
    sqlx::query("UPDATE users SET work_stream_id = $2, school_id = NULL, updated_at = NOW() WHERE id = $1")
        .bind(manager_id)
        .bind(ws)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub struct WorkStreamService;

impl WorkStreamService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &WorkStreamListQuery) -> AppResult<Page<WorkStream>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM work_streams w WHERE TRUE");
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT w.* FROM work_streams w WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY w.name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<WorkStream>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<WorkStream> {
        match visible_workstream(actor)? {
            Some(own) if own != id => return Err(AppError::not_found("Workstream")),
            _ => {}
        }
        sqlx::query_as::<_, WorkStream>("SELECT * FROM work_streams WHERE id = $1 AND (is_active OR $2)")
            .bind(id)
            .bind(actor.is_admin())
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Workstream"))
    }

    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateWorkStreamRequest) -> AppResult<WorkStream> {
        rbac::require_admin(actor)?;

        let name = req.name.trim().to_string();
        let slug = match req.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.to_lowercase(),
            None => slugify(&name),
        };
        Validator::new()
            .require(&name, "name")
            .check(
                is_valid_slug(&slug),
                "slug",
                "Use 2 to 63 lowercase letters, digits or hyphens.",
            )
            .check(req.capacity >= 1, "capacity", "Capacity must be at least 1.")
            .finish()?;

        let mut tx = pool.begin().await?;
        let ws = sqlx::query_as::<_, WorkStream>(
            "INSERT INTO work_streams (name, slug, description, capacity, location)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(&name)
        .bind(&slug)
        .bind(req.description.as_deref())
        .bind(req.capacity)
        .bind(req.location.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(manager_id) = req.manager_id {
            link_manager(&mut tx, ws.id, manager_id, req.replace_manager).await?;
        }
        let ws = sqlx::query_as::<_, WorkStream>("SELECT * FROM work_streams WHERE id = $1")
            .bind(ws.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("workstream {} ({}) created by {}", ws.slug, ws.id, actor.id);
        Ok(ws)
    }

    /// Admin updates everything; the workstream's own manager may only edit
    /// the description, other fields are ignored for that role.
    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateWorkStreamRequest) -> AppResult<WorkStream> {
        rbac::ensure(rbac::can_manage_workstream(actor, id))?;

        let req = if actor.is_admin() {
            req
        } else {
            UpdateWorkStreamRequest {
                description: req.description,
                ..Default::default()
            }
        };

        let name = req.name.as_deref().map(str::trim).map(str::to_string);
        let mut v = Validator::new();
        if let Some(n) = &name {
            v.require(n, "name");
        }
        if let Some(c) = req.capacity {
            v.check(c >= 1, "capacity", "Capacity must be at least 1.");
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ws = sqlx::query_as::<_, WorkStream>(
            "UPDATE work_streams
             SET name = COALESCE($2, name),
                 description = CASE WHEN $3 THEN $4 ELSE description END,
                 capacity = COALESCE($5, capacity),
                 location = CASE WHEN $6 THEN $7 ELSE location END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(req.description.is_some())
        .bind(req.description.flatten())
        .bind(req.capacity)
        .bind(req.location.is_some())
        .bind(req.location.flatten())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("Workstream"))?;

        match req.manager_id {
            Some(Some(manager_id)) => link_manager(&mut tx, id, manager_id, req.replace_manager).await?,
            Some(None) => {
                sqlx::query("UPDATE work_streams SET manager_id = NULL WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        let ws = if req.manager_id.is_some() {
            sqlx::query_as::<_, WorkStream>("SELECT * FROM work_streams WHERE id = $1")
                .bind(ws.id)
                .fetch_one(&mut *tx)
                .await?
        } else {
            ws
        };
        tx.commit().await?;
        Ok(ws)
    }

    pub async fn deactivate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        rbac::require_admin(actor)?;
        let mut conn = pool.acquire().await?;
        if !soft_delete::deactivate(&mut conn, SoftDeletable::WorkStream, id, actor.id).await? {
            return Err(AppError::not_found("Workstream"));
        }
        tracing::info!("workstream {id} deactivated by {}", actor.id);
        Ok(())
    }

    pub async fn activate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<WorkStream> {
        rbac::require_admin(actor)?;
        let mut conn = pool.acquire().await?;
        if !soft_delete::activate(&mut conn, SoftDeletable::WorkStream, id).await? {
            return Err(AppError::not_found("Workstream"));
        }
        Ok(sqlx::query_as::<_, WorkStream>("SELECT * FROM work_streams WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Public landing information for an active workstream.
    pub async fn info(pool: &PgPool, id: Uuid) -> AppResult<WorkStreamInfo> {
        sqlx::query_as::<_, WorkStreamInfo>(
            "SELECT w.name, w.slug, w.description,
                    (SELECT COUNT(*) FROM schools s WHERE s.work_stream_id = w.id AND s.is_active) AS school_count
             FROM work_streams w
             WHERE w.id = $1 AND w.is_active",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Workstream"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole, ws: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role,
            work_stream_id: ws,
            school_id: None,
        }
    }

    #[test]
    fn managers_see_only_their_workstream() {
        let ws = Uuid::new_v4();
        assert_eq!(visible_workstream(&actor(UserRole::Admin, None)).unwrap(), None);
        assert_eq!(
            visible_workstream(&actor(UserRole::ManagerWorkstream, Some(ws))).unwrap(),
            Some(ws)
        );
        assert_eq!(
            visible_workstream(&actor(UserRole::ManagerSchool, Some(ws))).unwrap(),
            Some(ws)
        );
        assert!(visible_workstream(&actor(UserRole::ManagerWorkstream, None)).is_err());
        assert!(visible_workstream(&actor(UserRole::Teacher, Some(ws))).is_err());
    }

    #[test]
    fn list_filter_hides_inactive_for_managers() {
        let ws = Uuid::new_v4();
        let q = WorkStreamListQuery {
            include_inactive: true,
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT w.* FROM work_streams w WHERE TRUE");
        push_filters(&mut qb, &actor(UserRole::ManagerWorkstream, Some(ws)), &q).unwrap();
        assert!(qb.sql().contains("w.id = $1"));
        assert!(qb.sql().contains("w.is_active"));

        let mut qb = QueryBuilder::<Postgres>::new("SELECT w.* FROM work_streams w WHERE TRUE");
        push_filters(&mut qb, &actor(UserRole::Admin, None), &q).unwrap();
        assert!(!qb.sql().contains("is_active"));
    }
}
