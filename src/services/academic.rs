//! Academic structure of a school: years, grades, courses and classrooms.

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
        academic::{
            AcademicListQuery, AcademicYear, ClassRoom, Course, CreateAcademicYearRequest, CreateClassRoomRequest,
            CreateCourseRequest, CreateGradeRequest, Grade, UpdateAcademicYearRequest, UpdateClassRoomRequest,
            UpdateCourseRequest, UpdateGradeRequest,
        },
        auth::Actor,
        school::SchoolRef,
    },
    services::{
        rbac,
        schools::{owning_school, SchoolService},
    },
};

/// Row layout of one academic table for the shared list/get helpers.
struct Table {
    name: &'static str,
    entity: SoftDeletable,
    label: &'static str,
    search: &'static str,
    order: &'static str,
    cols: ScopeColumns,
    grade: bool,
    year: bool,
}

const YEARS: Table = Table {
    name: "academic_years",
    entity: SoftDeletable::AcademicYear,
    label: "Academic year",
    search: "t.academic_year_code",
    order: "t.start_date DESC",
    cols: ScopeColumns {
        work_stream: None,
        school: Some("t.school_id"),
        person: None,
        class_room: None,
        allocation: None,
        course: None,
    },
    grade: false,
    year: false,
};

const GRADES: Table = Table {
    name: "grades",
    entity: SoftDeletable::Grade,
    label: "Grade",
    search: "t.name",
    order: "t.numeric_level, t.name",
    cols: YEARS.cols,
    grade: false,
    year: false,
};

const COURSES: Table = Table {
    name: "courses",
    entity: SoftDeletable::Course,
    label: "Course",
    search: "t.name",
    order: "t.course_code",
    cols: ScopeColumns {
        course: Some("t.id"),
        ..YEARS.cols
    },
    grade: true,
    year: false,
};

const CLASS_ROOMS: Table = Table {
    name: "class_rooms",
    entity: SoftDeletable::ClassRoom,
    label: "Classroom",
    search: "t.classroom_name",
    order: "t.classroom_name",
    cols: ScopeColumns {
        class_room: Some("t.id"),
        ..YEARS.cols
    },
    grade: true,
    year: true,
};

fn may_see_inactive(actor: &Actor) -> bool {
    actor.is_admin() || actor.role.is_manager()
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, t: &Table, actor: &Actor, q: &AcademicListQuery) -> AppResult<()> {
    Scope::for_actor(actor)?.push_filter(qb, &t.cols);
    if !(q.include_inactive && may_see_inactive(actor)) {
        qb.push(" AND t.is_active");
    }
    if let Some(school) = q.school_id {
        qb.push(" AND t.school_id = ").push_bind(school);
    }
    if let (true, Some(grade)) = (t.grade, q.grade_id) {
        qb.push(" AND t.grade_id = ").push_bind(grade);
    }
    if let (true, Some(year)) = (t.year, q.academic_year_id) {
        qb.push(" AND t.academic_year_id = ").push_bind(year);
    }
    if let Some(search) = q.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(format!(" AND {} ILIKE ", t.search)).push_bind(format!("%{search}%"));
    }
    Ok(())
}

async fn list_rows<T>(pool: &PgPool, t: &Table, actor: &Actor, q: &AcademicListQuery) -> AppResult<Page<T>>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    let page = PageParams::new(q.page, q.page_size);

    let mut count_qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {} t WHERE TRUE", t.name));
    push_filters(&mut count_qb, t, actor, q)?;
    let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT t.* FROM {} t WHERE TRUE", t.name));
    push_filters(&mut qb, t, actor, q)?;
    qb.push(format!(" ORDER BY {}", t.order));
    page.push_limit(&mut qb);
    let rows = qb.build_query_as::<T>().fetch_all(pool).await?;

    Ok(page.wrap(count, rows))
}

async fn get_row<T>(pool: &PgPool, t: &Table, actor: &Actor, id: Uuid) -> AppResult<T>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT t.* FROM {} t WHERE t.id = ", t.name));
    qb.push_bind(id);
    Scope::for_actor(actor)?.push_filter(&mut qb, &t.cols);
    if !may_see_inactive(actor) {
        qb.push(" AND t.is_active");
    }
    qb.build_query_as::<T>()
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found(t.label))
}

/// School named in a create request, which the actor must manage.
async fn managed_school(conn: &mut PgConnection, actor: &Actor, school_id: Uuid) -> AppResult<SchoolRef> {
    let school = SchoolService::require_ref(&mut *conn, school_id, "school_id").await?;
    rbac::ensure(rbac::can_manage_school(actor, school))?;
    Ok(school)
}

/// School of an existing row, which the actor must manage.
async fn managed_row(conn: &mut PgConnection, actor: &Actor, t: &Table, id: Uuid) -> AppResult<SchoolRef> {
    let school = owning_school(&mut *conn, t.entity, id, t.label).await?;
    rbac::ensure(rbac::can_manage_school(actor, school))?;
    Ok(school)
}

async fn set_active(pool: &PgPool, actor: &Actor, t: &Table, id: Uuid, active: bool) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    managed_row(&mut tx, actor, t, id).await?;
    if active {
        soft_delete::activate(&mut tx, t.entity, id).await?;
    } else {
        soft_delete::deactivate(&mut tx, t.entity, id, actor.id).await?;
    }
    tx.commit().await?;
    tracing::info!("{} {id} {} by {}", t.name, if active { "activated" } else { "deactivated" }, actor.id);
    Ok(())
}

/// Checks that a referenced row belongs to `school`.
pub async fn ensure_in_school(
    conn: &mut PgConnection,
    table: &'static str,
    id: Uuid,
    school: Uuid,
    field: &str,
    message: &str,
) -> AppResult<()> {
    let ok: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1 AND school_id = $2 AND is_active)"
    ))
    .bind(id)
    .bind(school)
    .fetch_one(&mut *conn)
    .await?;
    if ok {
        Ok(())
    } else {
        Err(AppError::field(field, message))
    }
}

/// A homeroom teacher must be an active teacher of the classroom's school.
pub async fn ensure_school_teacher(conn: &mut PgConnection, teacher_id: Uuid, school: Uuid, field: &str) -> AppResult<()> {
    let ok: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM teachers t JOIN users u ON u.id = t.user_id
                        WHERE t.user_id = $1 AND u.school_id = $2 AND t.is_active AND u.is_active)",
    )
    .bind(teacher_id)
    .bind(school)
    .fetch_one(&mut *conn)
    .await?;
    if ok {
        Ok(())
    } else {
        Err(AppError::field(field, "Select an active teacher of this school."))
    }
}

pub fn valid_age_range(min_age: i32, max_age: i32) -> bool {
    min_age >= 0 && min_age <= max_age
}

pub struct AcademicService;

impl AcademicService {
    // ─── Academic years ─────────────────────────────────────────────────────

    pub async fn list_years(pool: &PgPool, actor: &Actor, q: &AcademicListQuery) -> AppResult<Page<AcademicYear>> {
        list_rows(pool, &YEARS, actor, q).await
    }

    pub async fn get_year(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<AcademicYear> {
        get_row(pool, &YEARS, actor, id).await
    }

    pub async fn create_year(pool: &PgPool, actor: &Actor, req: CreateAcademicYearRequest) -> AppResult<AcademicYear> {
        let code = req.academic_year_code.trim().to_string();
        Validator::new()
            .require(&code, "academic_year_code")
            .check(req.start_date < req.end_date, "end_date", "End date must be after the start date.")
            .finish()?;

        let mut tx = pool.begin().await?;
        managed_school(&mut tx, actor, req.school_id).await?;
        if req.is_current {
            clear_current_year(&mut tx, req.school_id, None).await?;
        }
        let year = sqlx::query_as::<_, AcademicYear>(
            "INSERT INTO academic_years (school_id, academic_year_code, start_date, end_date, is_current)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(req.school_id)
        .bind(&code)
        .bind(req.start_date)
        .bind(req.end_date)
        .bind(req.is_current)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(year)
    }

    pub async fn update_year(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateAcademicYearRequest,
    ) -> AppResult<AcademicYear> {
        let mut tx = pool.begin().await?;
        let school = managed_row(&mut tx, actor, &YEARS, id).await?;
        let current = sqlx::query_as::<_, AcademicYear>("SELECT * FROM academic_years WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        let start = req.start_date.unwrap_or(current.start_date);
        let end = req.end_date.unwrap_or(current.end_date);
        let code = req.academic_year_code.as_deref().map(str::trim).map(str::to_string);
        let mut v = Validator::new();
        if let Some(c) = &code {
            v.require(c, "academic_year_code");
        }
        v.check(start < end, "end_date", "End date must be after the start date.").finish()?;

        if req.is_current == Some(true) {
            clear_current_year(&mut tx, school.id, Some(id)).await?;
        }
        let year = sqlx::query_as::<_, AcademicYear>(
            "UPDATE academic_years
             SET academic_year_code = COALESCE($2, academic_year_code),
                 start_date = $3,
                 end_date = $4,
                 is_current = COALESCE($5, is_current),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(code)
        .bind(start)
        .bind(end)
        .bind(req.is_current)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(year)
    }

    pub async fn set_year_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_active(pool, actor, &YEARS, id, active).await
    }

    // ─── Grades ─────────────────────────────────────────────────────────────

    pub async fn list_grades(pool: &PgPool, actor: &Actor, q: &AcademicListQuery) -> AppResult<Page<Grade>> {
        list_rows(pool, &GRADES, actor, q).await
    }

    pub async fn get_grade(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Grade> {
        get_row(pool, &GRADES, actor, id).await
    }

    pub async fn create_grade(pool: &PgPool, actor: &Actor, req: CreateGradeRequest) -> AppResult<Grade> {
        let name = req.name.trim().to_string();
        Validator::new()
            .require(&name, "name")
            .check(req.numeric_level >= 1, "numeric_level", "Level must be at least 1.")
            .check(
                valid_age_range(req.min_age, req.max_age),
                "max_age",
                "Maximum age must not be lower than the minimum age.",
            )
            .finish()?;

        let mut tx = pool.begin().await?;
        managed_school(&mut tx, actor, req.school_id).await?;
        let grade = sqlx::query_as::<_, Grade>(
            "INSERT INTO grades (school_id, name, numeric_level, min_age, max_age)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(req.school_id)
        .bind(&name)
        .bind(req.numeric_level)
        .bind(req.min_age)
        .bind(req.max_age)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(grade)
    }

    pub async fn update_grade(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateGradeRequest) -> AppResult<Grade> {
        let mut tx = pool.begin().await?;
        managed_row(&mut tx, actor, &GRADES, id).await?;
        let current = sqlx::query_as::<_, Grade>("SELECT * FROM grades WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        let name = req.name.as_deref().map(str::trim).map(str::to_string);
        let level = req.numeric_level.unwrap_or(current.numeric_level);
        let min_age = req.min_age.unwrap_or(current.min_age);
        let max_age = req.max_age.unwrap_or(current.max_age);
        let mut v = Validator::new();
        if let Some(n) = &name {
            v.require(n, "name");
        }
        v.check(level >= 1, "numeric_level", "Level must be at least 1.")
            .check(
                valid_age_range(min_age, max_age),
                "max_age",
                "Maximum age must not be lower than the minimum age.",
            )
            .finish()?;

        let grade = sqlx::query_as::<_, Grade>(
            "UPDATE grades
             SET name = COALESCE($2, name), numeric_level = $3, min_age = $4, max_age = $5, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(level)
        .bind(min_age)
        .bind(max_age)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(grade)
    }

    pub async fn set_grade_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_active(pool, actor, &GRADES, id, active).await
    }

    // ─── Courses ────────────────────────────────────────────────────────────

    pub async fn list_courses(pool: &PgPool, actor: &Actor, q: &AcademicListQuery) -> AppResult<Page<Course>> {
        list_rows(pool, &COURSES, actor, q).await
    }

    pub async fn get_course(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Course> {
        get_row(pool, &COURSES, actor, id).await
    }

    pub async fn create_course(pool: &PgPool, actor: &Actor, req: CreateCourseRequest) -> AppResult<Course> {
        let code = req.course_code.trim().to_uppercase();
        let name = req.name.trim().to_string();
        Validator::new()
            .require(&code, "course_code")
            .require(&name, "name")
            .finish()?;

        let mut tx = pool.begin().await?;
        managed_school(&mut tx, actor, req.school_id).await?;
        ensure_in_school(&mut tx, "grades", req.grade_id, req.school_id, "grade_id", "Select a grade of this school.")
            .await?;
        let course = sqlx::query_as::<_, Course>(
            "INSERT INTO courses (school_id, grade_id, course_code, name, description)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(req.school_id)
        .bind(req.grade_id)
        .bind(&code)
        .bind(&name)
        .bind(req.description.as_deref())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(course)
    }

    pub async fn update_course(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateCourseRequest) -> AppResult<Course> {
        let mut tx = pool.begin().await?;
        let school = managed_row(&mut tx, actor, &COURSES, id).await?;

        let code = req.course_code.as_deref().map(|c| c.trim().to_uppercase());
        let name = req.name.as_deref().map(str::trim).map(str::to_string);
        let mut v = Validator::new();
        if let Some(c) = &code {
            v.require(c, "course_code");
        }
        if let Some(n) = &name {
            v.require(n, "name");
        }
        v.finish()?;
        if let Some(grade) = req.grade_id {
            ensure_in_school(&mut tx, "grades", grade, school.id, "grade_id", "Select a grade of this school.").await?;
        }

        let course = sqlx::query_as::<_, Course>(
            "UPDATE courses
             SET grade_id = COALESCE($2, grade_id),
                 course_code = COALESCE($3, course_code),
                 name = COALESCE($4, name),
                 description = CASE WHEN $5 THEN $6 ELSE description END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.grade_id)
        .bind(code)
        .bind(name)
        .bind(req.description.is_some())
        .bind(req.description.flatten())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(course)
    }

    pub async fn set_course_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_active(pool, actor, &COURSES, id, active).await
    }

    // ─── Classrooms ─────────────────────────────────────────────────────────

    pub async fn list_class_rooms(pool: &PgPool, actor: &Actor, q: &AcademicListQuery) -> AppResult<Page<ClassRoom>> {
        list_rows(pool, &CLASS_ROOMS, actor, q).await
    }

    pub async fn get_class_room(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<ClassRoom> {
        get_row(pool, &CLASS_ROOMS, actor, id).await
    }

    pub async fn create_class_room(pool: &PgPool, actor: &Actor, req: CreateClassRoomRequest) -> AppResult<ClassRoom> {
        let name = req.classroom_name.trim().to_string();
        Validator::new()
            .require(&name, "classroom_name")
            .check(req.capacity.map_or(true, |c| c >= 1), "capacity", "Capacity must be at least 1.")
            .finish()?;

        let mut tx = pool.begin().await?;
        managed_school(&mut tx, actor, req.school_id).await?;
        ensure_in_school(
            &mut tx,
            "academic_years",
            req.academic_year_id,
            req.school_id,
            "academic_year_id",
            "Select an academic year of this school.",
        )
        .await?;
        ensure_in_school(&mut tx, "grades", req.grade_id, req.school_id, "grade_id", "Select a grade of this school.")
            .await?;
        if let Some(teacher) = req.homeroom_teacher_id {
            ensure_school_teacher(&mut tx, teacher, req.school_id, "homeroom_teacher_id").await?;
        }

        let room = sqlx::query_as::<_, ClassRoom>(
            "INSERT INTO class_rooms (school_id, academic_year_id, grade_id, classroom_name, capacity, homeroom_teacher_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(req.school_id)
        .bind(req.academic_year_id)
        .bind(req.grade_id)
        .bind(&name)
        .bind(req.capacity)
        .bind(req.homeroom_teacher_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(room)
    }

    pub async fn update_class_room(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateClassRoomRequest,
    ) -> AppResult<ClassRoom> {
        let mut tx = pool.begin().await?;
        let school = managed_row(&mut tx, actor, &CLASS_ROOMS, id).await?;

        let name = req.classroom_name.as_deref().map(str::trim).map(str::to_string);
        let mut v = Validator::new();
        if let Some(n) = &name {
            v.require(n, "classroom_name");
        }
        if let Some(Some(c)) = req.capacity {
            v.check(c >= 1, "capacity", "Capacity must be at least 1.");
        }
        v.finish()?;
        if let Some(grade) = req.grade_id {
            ensure_in_school(&mut tx, "grades", grade, school.id, "grade_id", "Select a grade of this school.").await?;
        }
        if let Some(Some(teacher)) = req.homeroom_teacher_id {
            ensure_school_teacher(&mut tx, teacher, school.id, "homeroom_teacher_id").await?;
        }

        let room = sqlx::query_as::<_, ClassRoom>(
            "UPDATE class_rooms
             SET grade_id = COALESCE($2, grade_id),
                 classroom_name = COALESCE($3, classroom_name),
                 capacity = CASE WHEN $4 THEN $5 ELSE capacity END,
                 homeroom_teacher_id = CASE WHEN $6 THEN $7 ELSE homeroom_teacher_id END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.grade_id)
        .bind(name)
        .bind(req.capacity.is_some())
        .bind(req.capacity.flatten())
        .bind(req.homeroom_teacher_id.is_some())
        .bind(req.homeroom_teacher_id.flatten())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(room)
    }

    pub async fn set_class_room_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_active(pool, actor, &CLASS_ROOMS, id, active).await
    }
}

/// Only one academic year per school is current.
async fn clear_current_year(conn: &mut PgConnection, school_id: Uuid, except: Option<Uuid>) -> AppResult<()> {
    sqlx::query(
        "UPDATE academic_years SET is_current = FALSE, updated_at = NOW()
         WHERE school_id = $1 AND is_current AND id IS DISTINCT FROM $2",
    )
    .bind(school_id)
    .bind(except)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::UserRole;

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

    fn render(t: &Table, actor: &Actor, q: &AcademicListQuery) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT t.* FROM x t WHERE TRUE");
        push_filters(&mut qb, t, actor, q).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn age_range() {
        assert!(valid_age_range(5, 6));
        assert!(valid_age_range(6, 6));
        assert!(!valid_age_range(7, 6));
        assert!(!valid_age_range(-1, 6));
    }

    #[test]
    fn students_see_only_enrolled_classrooms() {
        let sql = render(&CLASS_ROOMS, &actor(UserRole::Student), &AcademicListQuery::default());
        assert!(sql.contains("t.id IN (SELECT class_room_id FROM student_enrollments"));
    }

    #[test]
    fn students_cannot_see_grades() {
        let sql = render(&GRADES, &actor(UserRole::Student), &AcademicListQuery::default());
        assert!(sql.contains("AND FALSE"));
    }

    #[test]
    fn filters_only_apply_where_columns_exist() {
        let q = AcademicListQuery {
            grade_id: Some(Uuid::new_v4()),
            academic_year_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let grades = render(&GRADES, &actor(UserRole::Admin), &q);
        assert!(!grades.contains("grade_id"));
        let rooms = render(&CLASS_ROOMS, &actor(UserRole::Admin), &q);
        assert!(rooms.contains("t.grade_id = $1"));
        assert!(rooms.contains("t.academic_year_id = $2"));
    }

    #[test]
    fn teachers_never_see_inactive_rows() {
        let q = AcademicListQuery {
            include_inactive: true,
            ..Default::default()
        };
        assert!(render(&COURSES, &actor(UserRole::Teacher), &q).contains("t.is_active"));
        assert!(!render(&COURSES, &actor(UserRole::Admin), &q).contains("t.is_active"));
    }
}
