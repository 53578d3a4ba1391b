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
        teacher::{CreateTeacherRequest, ProfileListQuery, Teacher, UpdateTeacherRequest, EMPLOYMENT_STATUSES},
        user::{UpdateUserRequest, UserRole},
    },
    services::{
        profiles,
        users::{NewAccount, UserService},
    },
};

const SELECT: &str = "SELECT t.user_id, u.email, u.full_name, u.phone, u.school_id, u.work_stream_id,
        t.specialization, t.hire_date, t.employment_status, t.highest_degree,
        t.years_of_experience, t.office_location, t.is_active, t.deactivated_at,
        t.created_at, t.updated_at
     FROM teachers t JOIN users u ON u.id = t.user_id";

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &ProfileListQuery) -> AppResult<()> {
    let scope = Scope::for_actor(actor)?;
    match scope {
        // Students and guardians see the teachers of their classes.
        Scope::Own(_) | Scope::GuardianOf(_) => {
            qb.push(" AND t.user_id IN (SELECT ca.teacher_id FROM course_allocations ca WHERE ca.is_active");
            scope.push_filter(qb, &ScopeColumns::default().with_allocation("ca.id"));
            qb.push(")");
        }
        _ => scope.push_filter(
            qb,
            &ScopeColumns {
                work_stream: Some("u.work_stream_id"),
                ..ScopeColumns::school("u.school_id")
            },
        ),
    }
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(" AND t.is_active");
    }
    if let Some(school) = q.school_id {
        qb.push(" AND u.school_id = ").push_bind(school);
    }
    if let Some(status) = q.status.as_deref() {
        qb.push(" AND t.employment_status = ").push_bind(status.to_string());
    }
    profiles::push_search(qb, q.search.as_deref());
    Ok(())
}

fn validate_status(v: &mut Validator, status: &str) {
    v.check(
        EMPLOYMENT_STATUSES.contains(&status),
        "employment_status",
        "Select a valid employment status.",
    );
}

pub struct TeacherService;

impl TeacherService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &ProfileListQuery) -> AppResult<Page<Teacher>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM teachers t JOIN users u ON u.id = t.user_id WHERE TRUE",
        );
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY u.full_name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<Teacher>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Teacher> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE t.user_id = ").push_bind(id);
        push_filters(
            &mut qb,
            actor,
            &ProfileListQuery {
                include_inactive: true,
                ..Default::default()
            },
        )?;
        qb.build_query_as::<Teacher>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Teacher"))
    }

    async fn load(conn: &mut PgConnection, id: Uuid) -> AppResult<Teacher> {
        Ok(sqlx::query_as::<_, Teacher>(&format!("{SELECT} WHERE t.user_id = $1"))
            .bind(id)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Creates the teacher account and its profile in one transaction.
    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateTeacherRequest) -> AppResult<Teacher> {
        let mut v = Validator::new();
        validate_status(&mut v, &req.employment_status);
        v.check(
            req.years_of_experience.map_or(true, |y| y >= 0),
            "years_of_experience",
            "Ensure this value is greater than or equal to 0.",
        );
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
                role: UserRole::Teacher,
                work_stream_id: None,
                school_id: Some(req.school_id),
                replace_manager: false,
            },
        )
        .await?;

        sqlx::query(
            "INSERT INTO teachers
                (user_id, specialization, hire_date, employment_status, highest_degree, years_of_experience, office_location)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(user.id)
        .bind(req.specialization.as_deref())
        .bind(req.hire_date)
        .bind(&req.employment_status)
        .bind(req.highest_degree.as_deref())
        .bind(req.years_of_experience)
        .bind(req.office_location.as_deref())
        .execute(&mut *tx)
        .await?;

        let teacher = Self::load(&mut tx, user.id).await?;
        tx.commit().await?;
        tracing::info!("teacher {} created by {}", teacher.user_id, actor.id);
        Ok(teacher)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateTeacherRequest) -> AppResult<Teacher> {
        let mut v = Validator::new();
        if let Some(status) = req.employment_status.as_deref() {
            validate_status(&mut v, status);
        }
        if let Some(Some(years)) = req.years_of_experience {
            v.check(years >= 0, "years_of_experience", "Ensure this value is greater than or equal to 0.");
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        profiles::ensure_role(&mut tx, id, UserRole::Teacher, "Teacher").await?;
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
            "UPDATE teachers
             SET specialization = CASE WHEN $2 THEN $3 ELSE specialization END,
                 hire_date = COALESCE($4, hire_date),
                 employment_status = COALESCE($5, employment_status),
                 highest_degree = CASE WHEN $6 THEN $7 ELSE highest_degree END,
                 years_of_experience = CASE WHEN $8 THEN $9 ELSE years_of_experience END,
                 office_location = CASE WHEN $10 THEN $11 ELSE office_location END,
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(id)
        .bind(req.specialization.is_some())
        .bind(req.specialization.flatten())
        .bind(req.hire_date)
        .bind(req.employment_status)
        .bind(req.highest_degree.is_some())
        .bind(req.highest_degree.flatten())
        .bind(req.years_of_experience.is_some())
        .bind(req.years_of_experience.flatten())
        .bind(req.office_location.is_some())
        .bind(req.office_location.flatten())
        .execute(&mut *tx)
        .await?;

        let teacher = Self::load(&mut tx, id).await?;
        tx.commit().await?;
        Ok(teacher)
    }

    pub async fn set_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        profiles::set_active(pool, actor, id, UserRole::Teacher, "Teacher", active).await
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

    fn render(actor: &Actor, q: &ProfileListQuery) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM teachers t JOIN users u ON u.id = t.user_id WHERE TRUE");
        push_filters(&mut qb, actor, q).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn students_see_their_class_teachers() {
        let sql = render(&actor(UserRole::Student), &ProfileListQuery::default());
        assert!(sql.contains("SELECT ca.teacher_id FROM course_allocations ca"));
        assert!(sql.contains("ca.id IN (SELECT ca.id FROM course_allocations ca"));
    }

    #[test]
    fn school_staff_filter_on_school() {
        let sql = render(&actor(UserRole::Secretary), &ProfileListQuery::default());
        assert!(sql.contains("AND u.school_id = $1"));
        assert!(sql.contains("AND t.is_active"));
    }

    #[test]
    fn status_is_validated() {
        let mut v = Validator::new();
        validate_status(&mut v, "full_time");
        assert!(v.finish().is_ok());
        validate_status(&mut v, "volunteer");
        assert!(v.finish().is_err());
    }
}
