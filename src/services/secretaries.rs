use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        scope::{Scope, ScopeColumns},
    },
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        secretary::{CreateSecretaryRequest, Secretary, UpdateSecretaryRequest},
        teacher::ProfileListQuery,
        user::{UpdateUserRequest, UserRole},
    },
    services::{
        profiles,
        users::{NewAccount, UserService},
    },
};

const SELECT: &str = "SELECT s.user_id, u.email, u.full_name, u.phone, u.school_id,
        s.department, s.office_number, s.hire_date, s.is_active, s.deactivated_at,
        s.created_at, s.updated_at
     FROM secretaries s JOIN users u ON u.id = s.user_id";

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &ProfileListQuery) -> AppResult<()> {
    match Scope::for_actor(actor)? {
        Scope::Own(_) | Scope::GuardianOf(_) => {
            qb.push(" AND FALSE");
        }
        // School staff see their colleagues in the secretariat.
        scope => scope.push_filter(
            qb,
            &ScopeColumns {
                work_stream: Some("u.work_stream_id"),
                ..ScopeColumns::school("u.school_id")
            },
        ),
    }
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(" AND s.is_active");
    }
    if let Some(school) = q.school_id {
        qb.push(" AND u.school_id = ").push_bind(school);
    }
    profiles::push_search(qb, q.search.as_deref());
    Ok(())
}

fn check_department(v: &mut Validator, department: &str) {
    v.check(!department.trim().is_empty(), "department", "This field may not be blank.");
}

/// Secretaries are managed by admins and managers, never by other secretaries.
fn ensure_manager(actor: &Actor) -> AppResult<()> {
    if actor.is_admin() || actor.role.is_manager() {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

pub struct SecretaryService;

impl SecretaryService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &ProfileListQuery) -> AppResult<Page<Secretary>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM secretaries s JOIN users u ON u.id = s.user_id WHERE TRUE",
        );
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY u.full_name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<Secretary>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Secretary> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE s.user_id = ").push_bind(id);
        push_filters(
            &mut qb,
            actor,
            &ProfileListQuery {
                include_inactive: true,
                ..Default::default()
            },
        )?;
        qb.build_query_as::<Secretary>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Secretary"))
    }

    async fn load(conn: &mut PgConnection, id: Uuid) -> AppResult<Secretary> {
        Ok(sqlx::query_as::<_, Secretary>(&format!("{SELECT} WHERE s.user_id = $1"))
            .bind(id)
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateSecretaryRequest) -> AppResult<Secretary> {
        ensure_manager(actor)?;
        let mut v = Validator::new();
        check_department(&mut v, &req.department);
        v.finish()?;

        let mut tx = pool.begin().await?;
        let user = UserService::create_account(
            &mut tx,
            actor,
            NewAccount {
                email: req.email,
                full_name: req.full_name,
                phone: req.phone,
                password: req.password,
                role: UserRole::Secretary,
                work_stream_id: None,
                school_id: Some(req.school_id),
                replace_manager: false,
            },
        )
        .await?;

        sqlx::query(
            "INSERT INTO secretaries (user_id, department, office_number, hire_date)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(user.id)
        .bind(req.department.trim())
        .bind(req.office_number.as_deref())
        .bind(req.hire_date)
        .execute(&mut *tx)
        .await?;

        let secretary = Self::load(&mut tx, user.id).await?;
        tx.commit().await?;
        tracing::info!("secretary {} created by {}", secretary.user_id, actor.id);
        Ok(secretary)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateSecretaryRequest) -> AppResult<Secretary> {
        ensure_manager(actor)?;
        let mut v = Validator::new();
        if let Some(department) = req.department.as_deref() {
            check_department(&mut v, department);
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        profiles::ensure_role(&mut tx, id, UserRole::Secretary, "Secretary").await?;
        UserService::update_account(
            &mut tx,
            actor,
            id,
            UpdateUserRequest {
                email: req.email,
                full_name: req.full_name,
                phone: req.phone,
                ..Default::default()
            },
        )
        .await?;

        sqlx::query(
            "UPDATE secretaries
             SET department = COALESCE($2, department),
                 office_number = CASE WHEN $3 THEN $4 ELSE office_number END,
                 hire_date = COALESCE($5, hire_date),
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(id)
        .bind(req.department.as_deref().map(str::trim))
        .bind(req.office_number.is_some())
        .bind(req.office_number.flatten())
        .bind(req.hire_date)
        .execute(&mut *tx)
        .await?;

        let secretary = Self::load(&mut tx, id).await?;
        tx.commit().await?;
        Ok(secretary)
    }

    pub async fn set_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        ensure_manager(actor)?;
        profiles::set_active(pool, actor, id, UserRole::Secretary, "Secretary", active).await
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

    #[test]
    fn students_see_no_secretaries() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        push_filters(&mut qb, &actor(UserRole::Student), &ProfileListQuery::default()).unwrap();
        assert!(qb.sql().contains("AND FALSE"));
    }

    #[test]
    fn secretaries_cannot_manage_secretaries() {
        assert!(ensure_manager(&actor(UserRole::Secretary)).is_err());
        assert!(ensure_manager(&actor(UserRole::ManagerSchool)).is_ok());
    }

    #[test]
    fn blank_department_is_rejected() {
        let mut v = Validator::new();
        check_department(&mut v, "  ");
        assert!(v.finish().is_err());
    }
}
