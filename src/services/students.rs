use chrono::Utc;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
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
        school::SchoolRef,
        student::{
            CreateEnrollmentRequest, CreateStudentRequest, EnrollmentListQuery, Student, StudentEnrollment,
            UpdateEnrollmentRequest, UpdateStudentRequest, ENROLLMENT_STATUSES, STUDENT_STATUSES,
        },
        teacher::ProfileListQuery,
        user::{UpdateUserRequest, UserRole},
    },
    services::{
        profiles, rbac,
        users::{NewAccount, UserService},
    },
};

const SELECT: &str = "SELECT st.user_id, u.email, u.full_name, u.phone, st.school_id, st.grade_id,
        st.date_of_birth, st.admission_date, st.current_status, st.address, st.medical_notes,
        st.is_active, st.deactivated_at, st.created_at, st.updated_at
     FROM students st JOIN users u ON u.id = st.user_id";

fn student_cols() -> ScopeColumns {
    ScopeColumns::school("st.school_id").with_person("st.user_id")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &ProfileListQuery) -> AppResult<()> {
    Scope::for_actor(actor)?.push_filter(qb, &student_cols());
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(" AND st.is_active");
    }
    if let Some(school) = q.school_id {
        qb.push(" AND st.school_id = ").push_bind(school);
    }
    if let Some(grade) = q.grade_id {
        qb.push(" AND st.grade_id = ").push_bind(grade);
    }
    if let Some(status) = q.status.as_deref() {
        qb.push(" AND st.current_status = ").push_bind(status.to_string());
    }
    profiles::push_search(qb, q.search.as_deref());
    Ok(())
}

fn push_enrollment_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    actor: &Actor,
    q: &EnrollmentListQuery,
) -> AppResult<()> {
    Scope::for_actor(actor)?.push_filter(qb, &ScopeColumns::school("st.school_id").with_person("e.student_id"));
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(" AND e.is_active");
    }
    if let Some(student) = q.student_id {
        qb.push(" AND e.student_id = ").push_bind(student);
    }
    if let Some(room) = q.class_room_id {
        qb.push(" AND e.class_room_id = ").push_bind(room);
    }
    if let Some(year) = q.academic_year_id {
        qb.push(" AND e.academic_year_id = ").push_bind(year);
    }
    if let Some(status) = q.status.as_deref() {
        qb.push(" AND e.status = ").push_bind(status.to_string());
    }
    Ok(())
}

async fn ensure_grade(conn: &mut PgConnection, grade_id: Uuid, school_id: Uuid) -> AppResult<()> {
    let ok: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM grades WHERE id = $1 AND school_id = $2 AND is_active)",
    )
    .bind(grade_id)
    .bind(school_id)
    .fetch_one(&mut *conn)
    .await?;
    if ok {
        Ok(())
    } else {
        Err(AppError::field("grade_id", "Select a grade of the student's school."))
    }
}

/// School of a student profile, with its workstream.
async fn student_school(conn: &mut PgConnection, student_id: Uuid) -> AppResult<SchoolRef> {
    sqlx::query_as::<_, SchoolRef>(
        "SELECT s.id, s.work_stream_id FROM students st JOIN schools s ON s.id = st.school_id
         WHERE st.user_id = $1",
    )
    .bind(student_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Student"))
}

/// Whether one more student fits in a classroom with an optional capacity.
pub fn room_has_space(capacity: Option<i32>, enrolled: i64) -> bool {
    capacity.map_or(true, |c| enrolled < c as i64)
}

pub struct StudentService;

impl StudentService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &ProfileListQuery) -> AppResult<Page<Student>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM students st JOIN users u ON u.id = st.user_id WHERE TRUE",
        );
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY u.full_name");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<Student>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Student> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT);
        qb.push(" WHERE st.user_id = ").push_bind(id);
        push_filters(
            &mut qb,
            actor,
            &ProfileListQuery {
                include_inactive: true,
                ..Default::default()
            },
        )?;
        qb.build_query_as::<Student>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Student"))
    }

    async fn load(conn: &mut PgConnection, id: Uuid) -> AppResult<Student> {
        Ok(sqlx::query_as::<_, Student>(&format!("{SELECT} WHERE st.user_id = $1"))
            .bind(id)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Creates the student account and profile. School and workstream
    /// capacities are checked by the account creation.
    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateStudentRequest) -> AppResult<Student> {
        let admission_date = req.admission_date.unwrap_or_else(|| Utc::now().date_naive());
        Validator::new()
            .check(
                req.date_of_birth < admission_date,
                "date_of_birth",
                "Date of birth must be before the admission date.",
            )
            .finish()?;

        let mut tx = pool.begin().await?;
        let user = UserService::create_account(
            &mut tx,
            actor,
            NewAccount {
                email: req.email,
                full_name: req.full_name,
                phone: req.phone,
                password: req.password,
                role: UserRole::Student,
                work_stream_id: None,
                school_id: Some(req.school_id),
                replace_manager: false,
            },
        )
        .await?;
        if let Some(grade) = req.grade_id {
            ensure_grade(&mut tx, grade, req.school_id).await?;
        }

        sqlx::query(
            "INSERT INTO students
                (user_id, school_id, grade_id, date_of_birth, admission_date, address, medical_notes)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(user.id)
        .bind(req.school_id)
        .bind(req.grade_id)
        .bind(req.date_of_birth)
        .bind(admission_date)
        .bind(req.address.as_deref())
        .bind(req.medical_notes.as_deref())
        .execute(&mut *tx)
        .await?;

        let student = Self::load(&mut tx, user.id).await?;
        tx.commit().await?;
        tracing::info!("student {} created by {}", student.user_id, actor.id);
        Ok(student)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateStudentRequest) -> AppResult<Student> {
        let mut v = Validator::new();
        if let Some(status) = req.current_status.as_deref() {
            v.check(STUDENT_STATUSES.contains(&status), "current_status", "Select a valid status.");
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        profiles::ensure_role(&mut tx, id, UserRole::Student, "Student").await?;
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

        let school = student_school(&mut tx, id).await?;
        if let Some(Some(grade)) = req.grade_id {
            ensure_grade(&mut tx, grade, school.id).await?;
        }

        sqlx::query(
            "UPDATE students
             SET grade_id = CASE WHEN $2 THEN $3 ELSE grade_id END,
                 date_of_birth = COALESCE($4, date_of_birth),
                 admission_date = COALESCE($5, admission_date),
                 current_status = COALESCE($6, current_status),
                 address = CASE WHEN $7 THEN $8 ELSE address END,
                 medical_notes = CASE WHEN $9 THEN $10 ELSE medical_notes END,
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(id)
        .bind(req.grade_id.is_some())
        .bind(req.grade_id.flatten())
        .bind(req.date_of_birth)
        .bind(req.admission_date)
        .bind(req.current_status)
        .bind(req.address.is_some())
        .bind(req.address.flatten())
        .bind(req.medical_notes.is_some())
        .bind(req.medical_notes.flatten())
        .execute(&mut *tx)
        .await?;

        let student = Self::load(&mut tx, id).await?;
        tx.commit().await?;
        Ok(student)
    }

    pub async fn set_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        profiles::set_active(pool, actor, id, UserRole::Student, "Student", active).await
    }

    // ─── Enrollments ────────────────────────────────────────────────────────

    pub async fn list_enrollments(
        pool: &PgPool,
        actor: &Actor,
        q: &EnrollmentListQuery,
    ) -> AppResult<Page<StudentEnrollment>> {
        let page = PageParams::new(q.page, q.page_size);
        let from = " FROM student_enrollments e JOIN students st ON st.user_id = e.student_id WHERE TRUE";

        let mut count_qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*){from}"));
        push_enrollment_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT e.*{from}"));
        push_enrollment_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY e.enrolled_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<StudentEnrollment>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get_enrollment(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<StudentEnrollment> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT e.* FROM student_enrollments e JOIN students st ON st.user_id = e.student_id WHERE e.id = ",
        );
        qb.push_bind(id);
        push_enrollment_filters(
            &mut qb,
            actor,
            &EnrollmentListQuery {
                include_inactive: true,
                ..Default::default()
            },
        )?;
        qb.build_query_as::<StudentEnrollment>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Enrollment"))
    }

    /// Enrollments of one student, for the student's own and guardian views.
    pub async fn enrollments_of(pool: &PgPool, actor: &Actor, student_id: Uuid) -> AppResult<Page<StudentEnrollment>> {
        Self::get(pool, actor, student_id).await?;
        Self::list_enrollments(
            pool,
            actor,
            &EnrollmentListQuery {
                student_id: Some(student_id),
                page_size: Some(crate::db::pagination::MAX_PAGE_SIZE),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn enroll(pool: &PgPool, actor: &Actor, req: CreateEnrollmentRequest) -> AppResult<StudentEnrollment> {
        let mut tx = pool.begin().await?;
        let school = student_school(&mut tx, req.student_id)
            .await
            .map_err(|_| AppError::field("student_id", "Select a valid student."))?;
        rbac::ensure(rbac::can_administer_school(actor, school))?;

        let room: Option<(Uuid, Uuid, Option<i32>, i64)> = sqlx::query_as(
            "SELECT c.school_id, c.academic_year_id, c.capacity,
                    (SELECT COUNT(*) FROM student_enrollments e
                      WHERE e.class_room_id = c.id AND e.is_active AND e.status = 'enrolled')
             FROM class_rooms c WHERE c.id = $1 AND c.is_active",
        )
        .bind(req.class_room_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((room_school, room_year, capacity, enrolled)) = room else {
            return Err(AppError::field("class_room_id", "Select a valid, active classroom."));
        };

        let mut v = Validator::new();
        v.check(room_school == school.id, "class_room_id", "The classroom belongs to another school.")
            .check(
                room_year == req.academic_year_id,
                "academic_year_id",
                "The classroom is not part of this academic year.",
            )
            .check(room_has_space(capacity, enrolled), "class_room_id", "The classroom is full.");
        v.finish()?;

        let enrollment = sqlx::query_as::<_, StudentEnrollment>(
            "INSERT INTO student_enrollments (student_id, class_room_id, academic_year_id, enrolled_at)
             VALUES ($1, $2, $3, COALESCE($4, CURRENT_DATE))
             RETURNING *",
        )
        .bind(req.student_id)
        .bind(req.class_room_id)
        .bind(req.academic_year_id)
        .bind(req.enrolled_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(enrollment)
    }

    async fn enrollment_school(conn: &mut PgConnection, id: Uuid) -> AppResult<SchoolRef> {
        sqlx::query_as::<_, SchoolRef>(
            "SELECT s.id, s.work_stream_id FROM student_enrollments e
             JOIN students st ON st.user_id = e.student_id
             JOIN schools s ON s.id = st.school_id
             WHERE e.id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("Enrollment"))
    }

    pub async fn update_enrollment(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateEnrollmentRequest,
    ) -> AppResult<StudentEnrollment> {
        Validator::new()
            .check(ENROLLMENT_STATUSES.contains(&req.status.as_str()), "status", "Select a valid status.")
            .finish()?;

        let mut tx = pool.begin().await?;
        let school = Self::enrollment_school(&mut tx, id).await?;
        rbac::ensure(rbac::can_administer_school(actor, school))?;
        let enrollment = sqlx::query_as::<_, StudentEnrollment>(
            "UPDATE student_enrollments SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(&req.status)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(enrollment)
    }

    pub async fn set_enrollment_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let school = Self::enrollment_school(&mut tx, id).await?;
        rbac::ensure(rbac::can_administer_school(actor, school))?;
        if active {
            soft_delete::activate(&mut tx, SoftDeletable::Enrollment, id).await?;
        } else {
            soft_delete::deactivate(&mut tx, SoftDeletable::Enrollment, id, actor.id).await?;
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

    #[test]
    fn classroom_capacity() {
        assert!(room_has_space(None, 500));
        assert!(room_has_space(Some(30), 29));
        assert!(!room_has_space(Some(30), 30));
    }

    #[test]
    fn student_sees_only_itself() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM students st JOIN users u ON u.id = st.user_id WHERE TRUE");
        push_filters(&mut qb, &actor(UserRole::Student), &ProfileListQuery::default()).unwrap();
        assert!(qb.sql().contains("st.user_id IN ($1)"));
    }

    #[test]
    fn guardian_sees_linked_enrollments() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM student_enrollments e WHERE TRUE");
        push_enrollment_filters(&mut qb, &actor(UserRole::Guardian), &EnrollmentListQuery::default()).unwrap();
        assert!(qb
            .sql()
            .contains("e.student_id IN (SELECT student_id FROM guardian_student_links WHERE guardian_id = $1)"));
    }

    #[test]
    fn workstream_manager_sees_students_of_its_schools() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM students st WHERE TRUE");
        push_filters(&mut qb, &actor(UserRole::ManagerWorkstream), &ProfileListQuery::default()).unwrap();
        assert!(qb
            .sql()
            .contains("st.school_id IN (SELECT id FROM schools WHERE work_stream_id = $1)"));
    }
}
