//! Helpers shared by the teacher, student, guardian and secretary services.
//! Profiles live in their own tables keyed by the user id; the account row
//! carries the name, email and organisation.

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    models::{auth::Actor, user::UserRole},
    services::users::UserService,
};

pub fn may_see_inactive(actor: &Actor) -> bool {
    actor.is_admin() || actor.role.is_manager()
}

/// Name/email search on the joined `users u` row.
pub fn push_search(qb: &mut QueryBuilder<'_, Postgres>, search: Option<&str>) {
    if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        qb.push(" AND (u.full_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR u.email ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// 404 unless `id` is an account of `role`.
pub async fn ensure_role(conn: &mut PgConnection, id: Uuid, role: UserRole, label: &str) -> AppResult<()> {
    let stored: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match stored {
        Some(r) if r == role.as_str() => Ok(()),
        _ => Err(AppError::not_found(label)),
    }
}

/// Deactivation and activation go through the account so the profile, the
/// sessions and any manager slots follow.
pub async fn set_active(
    pool: &PgPool,
    actor: &Actor,
    id: Uuid,
    role: UserRole,
    label: &str,
    active: bool,
) -> AppResult<()> {
    {
        let mut conn = pool.acquire().await?;
        ensure_role(&mut conn, id, role, label).await?;
    }
    if active {
        UserService::activate(pool, actor, id).await?;
    } else {
        UserService::deactivate(pool, actor, id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_search_adds_nothing() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        push_search(&mut qb, Some("   "));
        assert_eq!(qb.sql(), "SELECT 1 WHERE TRUE");
        push_search(&mut qb, Some("ann"));
        assert!(qb.sql().contains("u.full_name ILIKE $1 OR u.email ILIKE $2"));
    }
}
