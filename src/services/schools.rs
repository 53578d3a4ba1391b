use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        scope::{Scope, ScopeColumns},
        soft_delete::{self, SoftDeletable},
    },
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        school::{CreateSchoolRequest, School, SchoolListQuery, SchoolRef, UpdateSchoolRequest},
        user::UserRole,
    },
    services::{
        rbac,
        users::{assign_manager, ManagedUnit},
    },
};

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: Scope) {
    match scope {
        // Students and guardians see the schools they study at.
        Scope::Own(id) => {
            qb.push(" AND s.id IN (SELECT school_id FROM students WHERE user_id = ")
                .push_bind(id)
                .push(")");
        }
        Scope::GuardianOf(id) => {
            qb.push(
                " AND s.id IN (SELECT st.school_id FROM students st
                   JOIN guardian_student_links l ON l.student_id = st.user_id
                   WHERE l.guardian_id = ",
            )
            .push_bind(id)
            .push(")");
        }
        _ => scope.push_filter(
            qb,
            &ScopeColumns {
                work_stream: Some("s.work_stream_id"),
                ..ScopeColumns::school("s.id")
            },
        ),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &SchoolListQuery) -> AppResult<()> {
    let scope = Scope::for_actor(actor)?;
    push_scope(qb, scope);
    if !(q.include_inactive && (actor.is_admin() || actor.role == UserRole::ManagerWorkstream)) {
        qb.push(" AND s.is_active");
    }
    if let Some(ws) = q.work_stream_id {
        qb.push(" AND s.work_stream_id = ").push_bind(ws);
    }
    if let Some(search) = q.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND s.school_name ILIKE ").push_bind(format!("%{search}%"));
    }
    Ok(())
}

/// Points a school manager's account at the school it now manages.
async fn link_manager(conn: &mut PgConnection, school: SchoolRef, manager_id: Uuid, replace: bool) -> AppResult<()> {
    let role: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1 AND is_active")
        .bind(manager_id)
        .fetch_optional(&mut *conn)
        .await?;
    if role.as_deref() != Some(UserRole::ManagerSchool.as_str()) {
        return Err(AppError::field(
            "manager_id",
            "The manager must be an active user with the school manager role.",
        ));
    }
    assign_manager(&mut *conn, ManagedUnit::School, school.id, manager_id, replace).await?;
    sqlx::query("UPDATE users SET school_id = $2, work_stream_id = $3, updated_at = NOW() WHERE id = $1")
        .bind(manager_id)
        .bind(school.id)
        .bind(school.work_stream_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// School owning an existing row of a school-scoped table.
pub async fn owning_school(
    conn: &mut PgConnection,
    entity: SoftDeletable,
    id: Uuid,
    label: &str,
) -> AppResult<SchoolRef> {
    sqlx::query_as::<_, SchoolRef>(&format!(
        "SELECT s.id, s.work_stream_id FROM {table} t JOIN schools s ON s.id = t.school_id WHERE t.{key} = $1",
        table = entity.table(),
        key = entity.key_column(),
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(label))
}

pub struct SchoolService;

impl SchoolService {
    /// The active school with its workstream, if any.
    pub async fn load_ref<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<SchoolRef>, sqlx::Error> {
        sqlx::query_as::<_, SchoolRef>("SELECT id, work_stream_id FROM schools WHERE id = $1 AND is_active")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Loads a school named in a request body; unknown or inactive schools are
    /// reported against `field`.
    pub async fn require_ref<'e, E: PgExecutor<'e>>(executor: E, id: Uuid, field: &str) -> AppResult<SchoolRef> {
        Self::load_ref(executor, id)
            .await?
            .ok_or_else(|| AppError::field(field, "Select a valid, active school."))
    }

    pub async fn list(pool: &PgPool, actor: &Actor, q: &SchoolListQuery) -> AppResult<Page<School>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM schools s WHERE TRUE");
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT s.* FROM schools s WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY s.school_name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<School>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<School> {
        let scope = Scope::for_actor(actor)?;
        let mut qb = QueryBuilder::<Postgres>::new("SELECT s.* FROM schools s WHERE s.id = ");
        qb.push_bind(id);
        push_scope(&mut qb, scope);
        if !(actor.is_admin() || actor.role.is_manager()) {
            qb.push(" AND s.is_active");
        }
        qb.build_query_as::<School>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("School"))
    }

    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateSchoolRequest) -> AppResult<School> {
        let work_stream_id = match (actor.role, req.work_stream_id) {
            (UserRole::Admin, Some(ws)) => ws,
            (UserRole::Admin, None) => return Err(AppError::field("work_stream_id", "This field is required.")),
            (UserRole::ManagerWorkstream, requested) => {
                let own = actor.work_stream_id.ok_or_else(AppError::forbidden)?;
                if requested.is_some_and(|ws| ws != own) {
                    return Err(AppError::forbidden());
                }
                own
            }
            _ => return Err(AppError::forbidden()),
        };

        let name = req.school_name.trim().to_string();
        Validator::new()
            .require(&name, "school_name")
            .check(req.capacity.map_or(true, |c| c >= 1), "capacity", "Capacity must be at least 1.")
            .finish()?;

        let mut tx = pool.begin().await?;
        let ws_active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM work_streams WHERE id = $1")
            .bind(work_stream_id)
            .fetch_optional(&mut *tx)
            .await?;
        if ws_active != Some(true) {
            return Err(AppError::field("work_stream_id", "Select a valid, active workstream."));
        }

        let school = sqlx::query_as::<_, School>(
            "INSERT INTO schools (work_stream_id, school_name, location, capacity, contact_email, contact_phone)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(work_stream_id)
        .bind(&name)
        .bind(req.location.as_deref())
        .bind(req.capacity)
        .bind(req.contact_email.as_deref())
        .bind(req.contact_phone.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        let school = match req.manager_id {
            Some(manager_id) => {
                link_manager(&mut tx, SchoolRef::from(&school), manager_id, req.replace_manager).await?;
                sqlx::query_as::<_, School>("SELECT * FROM schools WHERE id = $1")
                    .bind(school.id)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => school,
        };
        tx.commit().await?;

        tracing::info!("school {} created in workstream {} by {}", school.id, work_stream_id, actor.id);
        Ok(school)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateSchoolRequest) -> AppResult<School> {
        let mut tx = pool.begin().await?;
        let current = sqlx::query_as::<_, School>("SELECT * FROM schools WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("School"))?;
        rbac::ensure(rbac::can_manage_school(actor, SchoolRef::from(&current)))?;

        let moving = req.work_stream_id.is_some_and(|ws| ws != current.work_stream_id);
        if moving {
            rbac::require_admin(actor)?;
        }

        let name = req.school_name.as_deref().map(str::trim).map(str::to_string);
        let mut v = Validator::new();
        if let Some(n) = &name {
            v.require(n, "school_name");
        }
        if let Some(Some(c)) = req.capacity {
            v.check(c >= 1, "capacity", "Capacity must be at least 1.");
        }
        v.finish()?;

        let school = sqlx::query_as::<_, School>(
            "UPDATE schools
             SET work_stream_id = COALESCE($2, work_stream_id),
                 school_name = COALESCE($3, school_name),
                 location = CASE WHEN $4 THEN $5 ELSE location END,
                 capacity = CASE WHEN $6 THEN $7 ELSE capacity END,
                 contact_email = CASE WHEN $8 THEN $9 ELSE contact_email END,
                 contact_phone = CASE WHEN $10 THEN $11 ELSE contact_phone END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.work_stream_id)
        .bind(name)
        .bind(req.location.is_some())
        .bind(req.location.flatten())
        .bind(req.capacity.is_some())
        .bind(req.capacity.flatten())
        .bind(req.contact_email.is_some())
        .bind(req.contact_email.flatten())
        .bind(req.contact_phone.is_some())
        .bind(req.contact_phone.flatten())
        .fetch_one(&mut *tx)
        .await?;

        if moving {
            // Members follow their school into the new workstream.
            sqlx::query("UPDATE users SET work_stream_id = $2, updated_at = NOW() WHERE school_id = $1")
                .bind(id)
                .bind(school.work_stream_id)
                .execute(&mut *tx)
                .await?;
        }

        let changed_manager = match req.manager_id {
            Some(Some(manager_id)) => {
                link_manager(&mut tx, SchoolRef::from(&school), manager_id, req.replace_manager).await?;
                true
            }
            Some(None) => {
                sqlx::query("UPDATE schools SET manager_id = NULL WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            None => false,
        };
        let school = if changed_manager {
            sqlx::query_as::<_, School>("SELECT * FROM schools WHERE id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
        } else {
            school
        };
        tx.commit().await?;
        Ok(school)
    }

    /// School managers cannot deactivate or reactivate their own school.
    async fn ensure_can_toggle(conn: &mut PgConnection, actor: &Actor, id: Uuid) -> AppResult<()> {
        let school: SchoolRef = sqlx::query_as("SELECT id, work_stream_id FROM schools WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::not_found("School"))?;
        rbac::ensure(rbac::can_manage_workstream(actor, school.work_stream_id))
    }

    pub async fn deactivate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        Self::ensure_can_toggle(&mut tx, actor, id).await?;
        soft_delete::deactivate(&mut tx, SoftDeletable::School, id, actor.id).await?;
        tx.commit().await?;
        tracing::info!("school {id} deactivated by {}", actor.id);
        Ok(())
    }

    pub async fn activate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<School> {
        let mut tx = pool.begin().await?;
        Self::ensure_can_toggle(&mut tx, actor, id).await?;
        soft_delete::activate(&mut tx, SoftDeletable::School, id).await?;
        let school = sqlx::query_as::<_, School>("SELECT * FROM schools WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(school)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole, ws: Option<Uuid>, school: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role,
            work_stream_id: ws,
            school_id: school,
        }
    }

    fn sql_for(actor: &Actor) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT s.* FROM schools s WHERE TRUE");
        push_filters(&mut qb, actor, &SchoolListQuery::default()).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn workstream_manager_sees_schools_of_its_workstream() {
        let sql = sql_for(&actor(UserRole::ManagerWorkstream, Some(Uuid::new_v4()), None));
        assert!(sql.contains("s.work_stream_id = $1"));
        assert!(sql.ends_with("AND s.is_active"));
    }

    #[test]
    fn staff_see_only_their_school() {
        let sql = sql_for(&actor(UserRole::Teacher, Some(Uuid::new_v4()), Some(Uuid::new_v4())));
        assert!(sql.contains("AND s.id = $1"));
    }

    #[test]
    fn guardians_see_schools_of_linked_students() {
        let sql = sql_for(&actor(UserRole::Guardian, None, None));
        assert!(sql.contains("guardian_student_links"));
    }

    #[test]
    fn guests_cannot_list_schools() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        assert!(push_filters(&mut qb, &actor(UserRole::Guest, None, None), &SchoolListQuery::default()).is_err());
    }
}
