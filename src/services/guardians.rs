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
        guardian::{
            CreateGuardianRequest, Guardian, GuardianStudentLink, LinkStudentRequest, LinkedStudent,
            UpdateGuardianRequest, RELATIONSHIP_TYPES,
        },
        school::SchoolRef,
        teacher::ProfileListQuery,
        user::{UpdateUserRequest, UserRole},
    },
    services::{
        profiles, rbac,
        users::{NewAccount, UserService},
    },
};

const SELECT: &str = "SELECT g.user_id, u.email, u.full_name, u.phone, u.school_id,
        g.phone_number, g.occupation, g.is_active, g.deactivated_at, g.created_at, g.updated_at
     FROM guardians g JOIN users u ON u.id = g.user_id";

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &ProfileListQuery) -> AppResult<()> {
    match Scope::for_actor(actor)? {
        Scope::GuardianOf(id) => {
            qb.push(" AND g.user_id = ").push_bind(id);
        }
        Scope::Own(id) => {
            qb.push(" AND g.user_id IN (SELECT guardian_id FROM guardian_student_links WHERE student_id = ")
                .push_bind(id)
                .push(")");
        }
        // Staff also see guardians linked to students of their school.
        Scope::School(school) => {
            qb.push(" AND (u.school_id = ")
                .push_bind(school)
                .push(
                    " OR g.user_id IN (SELECT l.guardian_id FROM guardian_student_links l
                       JOIN students st ON st.user_id = l.student_id WHERE st.school_id = ",
                )
                .push_bind(school)
                .push("))");
        }
        scope => scope.push_filter(
            qb,
            &ScopeColumns {
                work_stream: Some("u.work_stream_id"),
                ..ScopeColumns::school("u.school_id")
            },
        ),
    }
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(" AND g.is_active");
    }
    if let Some(school) = q.school_id {
        qb.push(" AND u.school_id = ").push_bind(school);
    }
    profiles::push_search(qb, q.search.as_deref());
    Ok(())
}

/// Admin, managers and secretaries administer guardians; school-less
/// guardians are handled by workstream managers and admins only.
fn can_administer(actor: &Actor, school: Option<SchoolRef>) -> bool {
    match school {
        Some(s) => rbac::can_administer_school(actor, s),
        None => actor.is_admin(),
    }
}

async fn guardian_school(conn: &mut PgConnection, id: Uuid) -> AppResult<Option<SchoolRef>> {
    let row: Option<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
        "SELECT s.id, s.work_stream_id FROM guardians g
         JOIN users u ON u.id = g.user_id
         LEFT JOIN schools s ON s.id = u.school_id
         WHERE g.user_id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        None => Err(AppError::not_found("Guardian")),
        Some((Some(id), Some(work_stream_id))) => Ok(Some(SchoolRef { id, work_stream_id })),
        Some(_) => Ok(None),
    }
}

pub struct GuardianService;

impl GuardianService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &ProfileListQuery) -> AppResult<Page<Guardian>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM guardians g JOIN users u ON u.id = g.user_id WHERE TRUE",
        );
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY u.full_name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<Guardian>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Guardian> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE g.user_id = ").push_bind(id);
        push_filters(
            &mut qb,
            actor,
            &ProfileListQuery {
                include_inactive: true,
                ..Default::default()
            },
        )?;
        qb.build_query_as::<Guardian>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Guardian"))
    }

    async fn load(conn: &mut PgConnection, id: Uuid) -> AppResult<Guardian> {
        Ok(sqlx::query_as::<_, Guardian>(&format!("{SELECT} WHERE g.user_id = $1"))
            .bind(id)
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateGuardianRequest) -> AppResult<Guardian> {
        let mut tx = pool.begin().await?;
        let user = UserService::create_account(
            &mut tx,
            actor,
            NewAccount {
                email: req.email,
                full_name: req.full_name,
                phone: req.phone,
                password: req.password,
                role: UserRole::Guardian,
                work_stream_id: None,
                school_id: req.school_id,
                replace_manager: false,
            },
        )
        .await?;

        sqlx::query("INSERT INTO guardians (user_id, phone_number, occupation) VALUES ($1, $2, $3)")
            .bind(user.id)
            .bind(req.phone_number.as_deref())
            .bind(req.occupation.as_deref())
            .execute(&mut *tx)
            .await?;

        let guardian = Self::load(&mut tx, user.id).await?;
        tx.commit().await?;
        tracing::info!("guardian {} created by {}", guardian.user_id, actor.id);
        Ok(guardian)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateGuardianRequest) -> AppResult<Guardian> {
        let mut tx = pool.begin().await?;
        profiles::ensure_role(&mut tx, id, UserRole::Guardian, "Guardian").await?;
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
            "UPDATE guardians
             SET phone_number = CASE WHEN $2 THEN $3 ELSE phone_number END,
                 occupation = CASE WHEN $4 THEN $5 ELSE occupation END,
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(id)
        .bind(req.phone_number.is_some())
        .bind(req.phone_number.flatten())
        .bind(req.occupation.is_some())
        .bind(req.occupation.flatten())
        .execute(&mut *tx)
        .await?;

        let guardian = Self::load(&mut tx, id).await?;
        tx.commit().await?;
        Ok(guardian)
    }

    pub async fn set_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        profiles::set_active(pool, actor, id, UserRole::Guardian, "Guardian", active).await
    }

    /// Links a student; a guardian without a school joins the student's school.
    pub async fn link_student(
        pool: &PgPool,
        actor: &Actor,
        guardian_id: Uuid,
        req: LinkStudentRequest,
    ) -> AppResult<GuardianStudentLink> {
        Validator::new()
            .check(
                RELATIONSHIP_TYPES.contains(&req.relationship_type.as_str()),
                "relationship_type",
                "Select a valid relationship.",
            )
            .finish()?;

        let mut tx = pool.begin().await?;
        let guardian_school = guardian_school(&mut tx, guardian_id).await?;

        let student_school: Option<SchoolRef> = sqlx::query_as(
            "SELECT s.id, s.work_stream_id FROM students st JOIN schools s ON s.id = st.school_id
             WHERE st.user_id = $1 AND st.is_active",
        )
        .bind(req.student_id)
        .fetch_optional(&mut *tx)
        .await?;
        let student_school =
            student_school.ok_or_else(|| AppError::field("student_id", "Select a valid, active student."))?;
        rbac::ensure(rbac::can_administer_school(actor, student_school))?;
        if guardian_school.is_some() {
            rbac::ensure(can_administer(actor, guardian_school))?;
        }

        let link = sqlx::query_as::<_, GuardianStudentLink>(
            "INSERT INTO guardian_student_links (guardian_id, student_id, relationship_type)
             VALUES ($1, $2, $3)
             RETURNING *",
        )
        .bind(guardian_id)
        .bind(req.student_id)
        .bind(&req.relationship_type)
        .fetch_one(&mut *tx)
        .await?;

        if guardian_school.is_none() {
            sqlx::query(
                "UPDATE users SET school_id = $2, work_stream_id = $3, updated_at = NOW()
                 WHERE id = $1 AND school_id IS NULL",
            )
            .bind(guardian_id)
            .bind(student_school.id)
            .bind(student_school.work_stream_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(link)
    }

    pub async fn unlink_student(pool: &PgPool, actor: &Actor, guardian_id: Uuid, student_id: Uuid) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let school: Option<SchoolRef> = sqlx::query_as(
            "SELECT s.id, s.work_stream_id FROM guardian_student_links l
             JOIN students st ON st.user_id = l.student_id
             JOIN schools s ON s.id = st.school_id
             WHERE l.guardian_id = $1 AND l.student_id = $2",
        )
        .bind(guardian_id)
        .bind(student_id)
        .fetch_optional(&mut *tx)
        .await?;
        let school = school.ok_or_else(|| AppError::not_found("Link"))?;
        rbac::ensure(rbac::can_administer_school(actor, school))?;

        sqlx::query("DELETE FROM guardian_student_links WHERE guardian_id = $1 AND student_id = $2")
            .bind(guardian_id)
            .bind(student_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Students linked to a guardian visible to the actor.
    pub async fn students(pool: &PgPool, actor: &Actor, guardian_id: Uuid) -> AppResult<Vec<LinkedStudent>> {
        Self::get(pool, actor, guardian_id).await?;
        Ok(sqlx::query_as::<_, LinkedStudent>(
            "SELECT st.user_id AS student_id, u.full_name, u.email, st.school_id, st.grade_id,
                    st.current_status, l.relationship_type
             FROM guardian_student_links l
             JOIN students st ON st.user_id = l.student_id
             JOIN users u ON u.id = st.user_id
             WHERE l.guardian_id = $1 AND st.is_active
             ORDER BY u.full_name",
        )
        .bind(guardian_id)
        .fetch_all(pool)
        .await?)
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
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM guardians g JOIN users u ON u.id = g.user_id WHERE TRUE");
        push_filters(&mut qb, actor, &ProfileListQuery::default()).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn guardian_reads_itself() {
        assert!(render(&actor(UserRole::Guardian)).contains("AND g.user_id = $1"));
    }

    #[test]
    fn student_reads_its_guardians() {
        assert!(render(&actor(UserRole::Student)).contains("guardian_student_links WHERE student_id = $1"));
    }

    #[test]
    fn school_staff_see_guardians_of_their_students() {
        let sql = render(&actor(UserRole::Secretary));
        assert!(sql.contains("u.school_id = $1"));
        assert!(sql.contains("st.school_id = $2"));
    }

    #[test]
    fn schoolless_guardians_are_admin_business() {
        assert!(can_administer(&actor(UserRole::Admin), None));
        assert!(!can_administer(&actor(UserRole::ManagerSchool), None));
    }
}
