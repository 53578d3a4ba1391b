//! Teaching records hung off a course allocation: the allocations themselves,
//! assignments, marks, attendance, lesson plans and learning materials.

use std::collections::HashSet;

use sqlx::{postgres::PgRow, FromRow, PgConnection, PgPool, Postgres, QueryBuilder, Row};
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
        coursework::{
            AllocationContext, Assignment, Attendance, BulkAttendanceRequest, BulkMarksRequest, CourseAllocation,
            CourseworkListQuery, CreateAllocationRequest, CreateAssignmentRequest, CreateAttendanceRequest,
            CreateLearningMaterialRequest, CreateLessonPlanRequest, CreateMarkRequest, LearningMaterial, LessonPlan,
            Mark, UpdateAllocationRequest, UpdateAssignmentRequest, UpdateAttendanceRequest,
            UpdateLearningMaterialRequest, UpdateLessonPlanRequest, UpdateMarkRequest, ATTENDANCE_STATUSES,
            EXAM_TYPES, LESSON_PLAN_STATUSES,
        },
        user::UserRole,
    },
    services::{
        academic::{ensure_in_school, ensure_school_teacher},
        profiles, rbac,
        schools::SchoolService,
    },
};

/// How one coursework table joins up to its allocation and classroom.
struct Listing {
    entity: SoftDeletable,
    label: &'static str,
    alias: &'static str,
    from: &'static str,
    order: &'static str,
    cols: ScopeColumns,
    /// Author column, if the row records one.
    owner: Option<&'static str>,
    student: Option<&'static str>,
    assignment: Option<&'static str>,
    status: Option<&'static str>,
    date: Option<&'static str>,
}

const SCHOOL_COLS: ScopeColumns = ScopeColumns {
    work_stream: None,
    school: Some("cr.school_id"),
    person: None,
    class_room: None,
    allocation: None,
    course: None,
};

const ALLOCATIONS: Listing = Listing {
    entity: SoftDeletable::CourseAllocation,
    label: "Course allocation",
    alias: "ca",
    from: " FROM course_allocations ca JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "ca.created_at DESC",
    cols: ScopeColumns {
        allocation: Some("ca.id"),
        ..SCHOOL_COLS
    },
    owner: None,
    student: None,
    assignment: None,
    status: None,
    date: None,
};

const ASSIGNMENTS: Listing = Listing {
    entity: SoftDeletable::Assignment,
    label: "Assignment",
    alias: "x",
    from: " FROM assignments x
     JOIN course_allocations ca ON ca.id = x.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "x.due_date DESC NULLS LAST, x.created_at DESC",
    cols: ScopeColumns {
        allocation: Some("x.course_allocation_id"),
        ..SCHOOL_COLS
    },
    owner: Some("x.created_by"),
    student: None,
    assignment: None,
    status: None,
    date: None,
};

const MARKS: Listing = Listing {
    entity: SoftDeletable::Mark,
    label: "Mark",
    alias: "x",
    from: " FROM marks x
     JOIN assignments a ON a.id = x.assignment_id
     JOIN course_allocations ca ON ca.id = a.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "x.created_at DESC",
    cols: ScopeColumns {
        person: Some("x.student_id"),
        ..SCHOOL_COLS
    },
    owner: Some("x.graded_by"),
    student: Some("x.student_id"),
    assignment: Some("x.assignment_id"),
    status: None,
    date: None,
};

const ATTENDANCE: Listing = Listing {
    entity: SoftDeletable::Attendance,
    label: "Attendance record",
    alias: "x",
    from: " FROM attendance x
     JOIN course_allocations ca ON ca.id = x.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "x.date DESC, x.created_at DESC",
    cols: ScopeColumns {
        person: Some("x.student_id"),
        ..SCHOOL_COLS
    },
    owner: Some("x.recorded_by"),
    student: Some("x.student_id"),
    assignment: None,
    status: Some("x.status"),
    date: Some("x.date"),
};

const LESSON_PLANS: Listing = Listing {
    entity: SoftDeletable::LessonPlan,
    label: "Lesson plan",
    alias: "x",
    from: " FROM lesson_plans x
     JOIN course_allocations ca ON ca.id = x.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "x.plan_date DESC",
    cols: SCHOOL_COLS,
    owner: Some("x.teacher_id"),
    student: None,
    assignment: None,
    status: Some("x.status"),
    date: Some("x.plan_date"),
};

const MATERIALS: Listing = Listing {
    entity: SoftDeletable::LearningMaterial,
    label: "Learning material",
    alias: "x",
    from: " FROM learning_materials x
     JOIN course_allocations ca ON ca.id = x.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id",
    order: "x.created_at DESC",
    cols: ScopeColumns {
        allocation: Some("x.course_allocation_id"),
        ..SCHOOL_COLS
    },
    owner: Some("x.uploaded_by"),
    student: None,
    assignment: None,
    status: None,
    date: None,
};

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, l: &Listing, actor: &Actor, q: &CourseworkListQuery) -> AppResult<()> {
    Scope::for_actor(actor)?.push_filter(qb, &l.cols);
    if !(q.include_inactive && profiles::may_see_inactive(actor)) {
        qb.push(format!(" AND {}.is_active", l.alias));
    }
    if let Some(school) = q.school_id {
        qb.push(" AND cr.school_id = ").push_bind(school);
    }
    if let Some(allocation) = q.course_allocation_id {
        qb.push(" AND ca.id = ").push_bind(allocation);
    }
    if let Some(course) = q.course_id {
        qb.push(" AND ca.course_id = ").push_bind(course);
    }
    if let Some(room) = q.class_room_id {
        qb.push(" AND ca.class_room_id = ").push_bind(room);
    }
    if let Some(teacher) = q.teacher_id {
        qb.push(" AND ca.teacher_id = ").push_bind(teacher);
    }
    if let Some(year) = q.academic_year_id {
        qb.push(" AND ca.academic_year_id = ").push_bind(year);
    }
    if let (Some(col), Some(assignment)) = (l.assignment, q.assignment_id) {
        qb.push(format!(" AND {col} = ")).push_bind(assignment);
    }
    if let (Some(col), Some(student)) = (l.student, q.student_id) {
        qb.push(format!(" AND {col} = ")).push_bind(student);
    }
    if let (Some(col), Some(status)) = (l.status, q.status.as_deref()) {
        qb.push(format!(" AND {col} = ")).push_bind(status.to_string());
    }
    if let Some(col) = l.date {
        if let Some(from) = q.date_from {
            qb.push(format!(" AND {col} >= ")).push_bind(from);
        }
        if let Some(to) = q.date_to {
            qb.push(format!(" AND {col} <= ")).push_bind(to);
        }
    }
    Ok(())
}

async fn list_rows<T>(pool: &PgPool, l: &Listing, actor: &Actor, q: &CourseworkListQuery) -> AppResult<Page<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let page = PageParams::new(q.page, q.page_size);

    let mut count_qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*){} WHERE TRUE", l.from));
    push_filters(&mut count_qb, l, actor, q)?;
    let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {}.*{} WHERE TRUE", l.alias, l.from));
    push_filters(&mut qb, l, actor, q)?;
    qb.push(format!(" ORDER BY {}", l.order));
    page.push_limit(&mut qb);
    let rows = qb.build_query_as::<T>().fetch_all(pool).await?;

    Ok(page.wrap(count, rows))
}

async fn get_row<T>(pool: &PgPool, l: &Listing, actor: &Actor, id: Uuid) -> AppResult<T>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {a}.*{f} WHERE {a}.id = ", a = l.alias, f = l.from));
    qb.push_bind(id);
    push_filters(
        &mut qb,
        l,
        actor,
        &CourseworkListQuery {
            include_inactive: true,
            ..Default::default()
        },
    )?;
    qb.build_query_as::<T>()
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found(l.label))
}

const CONTEXT: &str = "SELECT ca.id, ca.teacher_id, ca.class_room_id, ca.academic_year_id, cr.school_id, s.work_stream_id
     FROM course_allocations ca
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     JOIN schools s ON s.id = cr.school_id";

/// Active allocation named in a request body.
async fn active_allocation(conn: &mut PgConnection, id: Uuid) -> AppResult<AllocationContext> {
    sqlx::query_as::<_, AllocationContext>(&format!("{CONTEXT} WHERE ca.id = $1 AND ca.is_active"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::field("course_allocation_id", "Select a valid, active course allocation."))
}

/// Allocation behind an existing row, with the row's author where it records one.
async fn row_context(conn: &mut PgConnection, l: &Listing, id: Uuid) -> AppResult<(AllocationContext, Option<Uuid>)> {
    let row: Option<PgRow> = sqlx::query(&format!(
        "SELECT ca.id, ca.teacher_id, ca.class_room_id, ca.academic_year_id, cr.school_id, s.work_stream_id,
                {owner} AS owner_id
         {from}
         JOIN schools s ON s.id = cr.school_id
         WHERE {alias}.id = $1",
        owner = l.owner.unwrap_or("NULL::uuid"),
        from = l.from,
        alias = l.alias,
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let row = row.ok_or_else(|| AppError::not_found(l.label))?;
    Ok((AllocationContext::from_row(&row)?, row.try_get("owner_id")?))
}

/// The allocation's own teacher, or someone who manages its school.
fn can_teach(actor: &Actor, ctx: &AllocationContext) -> bool {
    (actor.role == UserRole::Teacher && actor.id == ctx.teacher_id) || rbac::can_manage_school(actor, ctx.school())
}

/// Lesson plans and materials stay with their author even after the allocation
/// changes hands.
fn can_edit_authored(actor: &Actor, ctx: &AllocationContext, owner: Option<Uuid>) -> bool {
    owner == Some(actor.id) || rbac::can_manage_school(actor, ctx.school())
}

async fn set_row_active(
    pool: &PgPool,
    actor: &Actor,
    l: &Listing,
    id: Uuid,
    active: bool,
    allowed: fn(&Actor, &AllocationContext, Option<Uuid>) -> bool,
) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    let (ctx, owner) = row_context(&mut tx, l, id).await?;
    rbac::ensure(allowed(actor, &ctx, owner))?;
    if active {
        soft_delete::activate(&mut tx, l.entity, id).await?;
    } else {
        soft_delete::deactivate(&mut tx, l.entity, id, actor.id).await?;
    }
    tx.commit().await?;
    tracing::info!("{} {id} {} by {}", l.label, if active { "activated" } else { "deactivated" }, actor.id);
    Ok(())
}

/// Marks and attendance are only kept for students enrolled in the
/// allocation's classroom for its academic year.
async fn ensure_enrolled(conn: &mut PgConnection, student_id: Uuid, ctx: &AllocationContext, field: &str) -> AppResult<()> {
    let ok: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM student_enrollments
                        WHERE student_id = $1 AND class_room_id = $2 AND academic_year_id = $3 AND is_active)",
    )
    .bind(student_id)
    .bind(ctx.class_room_id)
    .bind(ctx.academic_year_id)
    .fetch_one(&mut *conn)
    .await?;
    if ok {
        Ok(())
    } else {
        Err(AppError::field(field, "The student is not enrolled in this classroom for the academic year."))
    }
}

pub fn score_in_range(score: f64, full_mark: f64) -> bool {
    score.is_finite() && score >= 0.0 && score <= full_mark
}

pub fn valid_file_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("https://") || url.starts_with("http://") || (url.starts_with('/') && url.len() > 1)
}

fn check_assignment(v: &mut Validator, exam_type: Option<&str>, full_mark: Option<f64>) {
    if let Some(exam_type) = exam_type {
        v.check(EXAM_TYPES.contains(&exam_type), "exam_type", "Select a valid exam type.");
    }
    if let Some(full_mark) = full_mark {
        v.check(
            full_mark.is_finite() && full_mark > 0.0,
            "full_mark",
            "Full mark must be greater than 0.",
        );
    }
}

fn check_attendance_status(v: &mut Validator, field: &str, status: &str) {
    v.check(ATTENDANCE_STATUSES.contains(&status), field, "Select a valid attendance status.");
}

/// Assignment being graded, with its full mark.
async fn gradable_assignment(conn: &mut PgConnection, id: Uuid) -> AppResult<(AllocationContext, f64)> {
    let row: Option<PgRow> = sqlx::query(
        "SELECT ca.id, ca.teacher_id, ca.class_room_id, ca.academic_year_id, cr.school_id, s.work_stream_id, a.full_mark
         FROM assignments a
         JOIN course_allocations ca ON ca.id = a.course_allocation_id
         JOIN class_rooms cr ON cr.id = ca.class_room_id
         JOIN schools s ON s.id = cr.school_id
         WHERE a.id = $1 AND a.is_active AND ca.is_active",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let row = row.ok_or_else(|| AppError::field("assignment_id", "Select a valid, active assignment."))?;
    Ok((AllocationContext::from_row(&row)?, row.try_get("full_mark")?))
}

const UPSERT_MARK: &str = "INSERT INTO marks (student_id, assignment_id, score, feedback, graded_by)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (student_id, assignment_id) DO UPDATE
     SET score = EXCLUDED.score, feedback = EXCLUDED.feedback, graded_by = EXCLUDED.graded_by,
         is_active = TRUE, deactivated_at = NULL, deactivated_by = NULL, updated_at = NOW()
     RETURNING *";

const UPSERT_ATTENDANCE: &str = "INSERT INTO attendance (student_id, course_allocation_id, date, status, note, recorded_by)
     VALUES ($1, $2, $3, $4, $5, $6)
     ON CONFLICT (student_id, course_allocation_id, date) DO UPDATE
     SET status = EXCLUDED.status, note = EXCLUDED.note, recorded_by = EXCLUDED.recorded_by,
         is_active = TRUE, deactivated_at = NULL, deactivated_by = NULL, updated_at = NOW()
     RETURNING *";

pub struct CourseworkService;

impl CourseworkService {
    // ── Course allocations ──────────────────────────────────────────────

    pub async fn list_allocations(
        pool: &PgPool,
        actor: &Actor,
        q: &CourseworkListQuery,
    ) -> AppResult<Page<CourseAllocation>> {
        list_rows(pool, &ALLOCATIONS, actor, q).await
    }

    pub async fn get_allocation(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<CourseAllocation> {
        get_row(pool, &ALLOCATIONS, actor, id).await
    }

    /// Course, classroom and teacher must share a school, and the classroom
    /// must belong to the requested academic year.
    pub async fn create_allocation(
        pool: &PgPool,
        actor: &Actor,
        req: CreateAllocationRequest,
    ) -> AppResult<CourseAllocation> {
        let mut tx = pool.begin().await?;
        let room: Option<(Uuid, Uuid)> =
            sqlx::query_as("SELECT school_id, academic_year_id FROM class_rooms WHERE id = $1 AND is_active")
                .bind(req.class_room_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (school_id, room_year) =
            room.ok_or_else(|| AppError::field("class_room_id", "Select a valid, active classroom."))?;
        let school = SchoolService::require_ref(&mut *tx, school_id, "class_room_id").await?;
        rbac::ensure(rbac::can_administer_school(actor, school))?;

        Validator::new()
            .check(
                room_year == req.academic_year_id,
                "academic_year_id",
                "The classroom does not belong to this academic year.",
            )
            .finish()?;
        ensure_in_school(
            &mut tx,
            "courses",
            req.course_id,
            school.id,
            "course_id",
            "Select an active course of the classroom's school.",
        )
        .await?;
        ensure_school_teacher(&mut tx, req.teacher_id, school.id, "teacher_id").await?;

        let allocation = sqlx::query_as::<_, CourseAllocation>(
            "INSERT INTO course_allocations (course_id, class_room_id, teacher_id, academic_year_id)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(req.course_id)
        .bind(req.class_room_id)
        .bind(req.teacher_id)
        .bind(req.academic_year_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!("course allocation {} created by {}", allocation.id, actor.id);
        Ok(allocation)
    }

    /// Reassigns the allocation to another teacher of the same school.
    pub async fn update_allocation(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateAllocationRequest,
    ) -> AppResult<CourseAllocation> {
        let mut tx = pool.begin().await?;
        let (ctx, _) = row_context(&mut tx, &ALLOCATIONS, id).await?;
        rbac::ensure(rbac::can_administer_school(actor, ctx.school()))?;
        ensure_school_teacher(&mut tx, req.teacher_id, ctx.school_id, "teacher_id").await?;

        let allocation = sqlx::query_as::<_, CourseAllocation>(
            "UPDATE course_allocations SET teacher_id = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(req.teacher_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(allocation)
    }

    pub async fn set_allocation_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &ALLOCATIONS, id, active, |actor, ctx, _| {
            rbac::can_administer_school(actor, ctx.school())
        })
        .await
    }

    // ── Assignments ─────────────────────────────────────────────────────

    pub async fn list_assignments(pool: &PgPool, actor: &Actor, q: &CourseworkListQuery) -> AppResult<Page<Assignment>> {
        list_rows(pool, &ASSIGNMENTS, actor, q).await
    }

    pub async fn get_assignment(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Assignment> {
        get_row(pool, &ASSIGNMENTS, actor, id).await
    }

    /// Teachers create assignments under their own allocations only; the
    /// allocation's teacher is recorded as the author.
    pub async fn create_assignment(pool: &PgPool, actor: &Actor, req: CreateAssignmentRequest) -> AppResult<Assignment> {
        let mut v = Validator::new();
        v.require(&req.assignment_code, "assignment_code").require(&req.title, "title");
        check_assignment(&mut v, Some(&req.exam_type), Some(req.full_mark));
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ctx = active_allocation(&mut tx, req.course_allocation_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        let assignment = sqlx::query_as::<_, Assignment>(
            "INSERT INTO assignments
                (course_allocation_id, created_by, assignment_code, title, description, due_date, exam_type, full_mark)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(ctx.id)
        .bind(ctx.teacher_id)
        .bind(req.assignment_code.trim())
        .bind(req.title.trim())
        .bind(req.description.as_deref())
        .bind(req.due_date)
        .bind(&req.exam_type)
        .bind(req.full_mark)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!("assignment {} created by {}", assignment.id, actor.id);
        Ok(assignment)
    }

    pub async fn update_assignment(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateAssignmentRequest,
    ) -> AppResult<Assignment> {
        let mut v = Validator::new();
        if let Some(code) = req.assignment_code.as_deref() {
            v.require(code, "assignment_code");
        }
        if let Some(title) = req.title.as_deref() {
            v.require(title, "title");
        }
        check_assignment(&mut v, req.exam_type.as_deref(), req.full_mark);
        v.finish()?;

        let mut tx = pool.begin().await?;
        let (ctx, _) = row_context(&mut tx, &ASSIGNMENTS, id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        if let Some(full_mark) = req.full_mark {
            let top: Option<f64> =
                sqlx::query_scalar("SELECT MAX(score) FROM marks WHERE assignment_id = $1 AND is_active")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
            Validator::new()
                .check(
                    top.map_or(true, |top| top <= full_mark),
                    "full_mark",
                    "Full mark cannot be lower than an existing score.",
                )
                .finish()?;
        }

        let assignment = sqlx::query_as::<_, Assignment>(
            "UPDATE assignments
             SET assignment_code = COALESCE($2, assignment_code),
                 title = COALESCE($3, title),
                 description = CASE WHEN $4 THEN $5 ELSE description END,
                 due_date = CASE WHEN $6 THEN $7 ELSE due_date END,
                 exam_type = COALESCE($8, exam_type),
                 full_mark = COALESCE($9, full_mark),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.assignment_code.as_deref().map(str::trim))
        .bind(req.title.as_deref().map(str::trim))
        .bind(req.description.is_some())
        .bind(req.description.flatten())
        .bind(req.due_date.is_some())
        .bind(req.due_date.flatten())
        .bind(req.exam_type)
        .bind(req.full_mark)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(assignment)
    }

    pub async fn set_assignment_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &ASSIGNMENTS, id, active, |actor, ctx, _| can_teach(actor, ctx)).await
    }

    // ── Marks ───────────────────────────────────────────────────────────

    pub async fn list_marks(pool: &PgPool, actor: &Actor, q: &CourseworkListQuery) -> AppResult<Page<Mark>> {
        list_rows(pool, &MARKS, actor, q).await
    }

    pub async fn get_mark(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Mark> {
        get_row(pool, &MARKS, actor, id).await
    }

    /// Records a mark, replacing any earlier one for the same student and
    /// assignment.
    pub async fn record_mark(pool: &PgPool, actor: &Actor, req: CreateMarkRequest) -> AppResult<Mark> {
        let mut tx = pool.begin().await?;
        let (ctx, full_mark) = gradable_assignment(&mut tx, req.assignment_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;
        Validator::new()
            .check(
                score_in_range(req.score, full_mark),
                "score",
                &format!("Score must be between 0 and the full mark ({full_mark})."),
            )
            .finish()?;
        ensure_enrolled(&mut tx, req.student_id, &ctx, "student_id").await?;

        let mark = sqlx::query_as::<_, Mark>(UPSERT_MARK)
            .bind(req.student_id)
            .bind(req.assignment_id)
            .bind(req.score)
            .bind(req.feedback.as_deref())
            .bind(actor.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(mark)
    }

    /// Grades a whole assignment at once; every entry is validated before
    /// anything is written.
    pub async fn record_marks(
        pool: &PgPool,
        actor: &Actor,
        assignment_id: Uuid,
        req: BulkMarksRequest,
    ) -> AppResult<Vec<Mark>> {
        let mut tx = pool.begin().await?;
        let (ctx, full_mark) = gradable_assignment(&mut tx, assignment_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        let mut v = Validator::new();
        v.check(!req.marks.is_empty(), "marks", "This list may not be empty.");
        let mut seen = HashSet::new();
        for (i, entry) in req.marks.iter().enumerate() {
            v.check(
                score_in_range(entry.score, full_mark),
                &format!("marks[{i}].score"),
                &format!("Score must be between 0 and the full mark ({full_mark})."),
            );
            v.check(
                seen.insert(entry.student_id),
                &format!("marks[{i}].student_id"),
                "Duplicate student in this request.",
            );
        }
        v.finish()?;
        for (i, entry) in req.marks.iter().enumerate() {
            ensure_enrolled(&mut tx, entry.student_id, &ctx, &format!("marks[{i}].student_id")).await?;
        }

        let mut marks = Vec::with_capacity(req.marks.len());
        for entry in &req.marks {
            let mark = sqlx::query_as::<_, Mark>(UPSERT_MARK)
                .bind(entry.student_id)
                .bind(assignment_id)
                .bind(entry.score)
                .bind(entry.feedback.as_deref())
                .bind(actor.id)
                .fetch_one(&mut *tx)
                .await?;
            marks.push(mark);
        }
        tx.commit().await?;
        tracing::info!("{} marks recorded for assignment {assignment_id} by {}", marks.len(), actor.id);
        Ok(marks)
    }

    pub async fn update_mark(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateMarkRequest) -> AppResult<Mark> {
        let mut tx = pool.begin().await?;
        let (ctx, _) = row_context(&mut tx, &MARKS, id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        if let Some(score) = req.score {
            let full_mark: f64 = sqlx::query_scalar(
                "SELECT a.full_mark FROM marks m JOIN assignments a ON a.id = m.assignment_id WHERE m.id = $1",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            Validator::new()
                .check(
                    score_in_range(score, full_mark),
                    "score",
                    &format!("Score must be between 0 and the full mark ({full_mark})."),
                )
                .finish()?;
        }

        let mark = sqlx::query_as::<_, Mark>(
            "UPDATE marks
             SET score = COALESCE($2, score),
                 feedback = CASE WHEN $3 THEN $4 ELSE feedback END,
                 graded_by = $5,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.score)
        .bind(req.feedback.is_some())
        .bind(req.feedback.flatten())
        .bind(actor.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(mark)
    }

    pub async fn set_mark_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &MARKS, id, active, |actor, ctx, _| can_teach(actor, ctx)).await
    }

    // ── Attendance ──────────────────────────────────────────────────────

    pub async fn list_attendance(pool: &PgPool, actor: &Actor, q: &CourseworkListQuery) -> AppResult<Page<Attendance>> {
        list_rows(pool, &ATTENDANCE, actor, q).await
    }

    pub async fn get_attendance(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Attendance> {
        get_row(pool, &ATTENDANCE, actor, id).await
    }

    /// Records attendance for one student and day, replacing an earlier record.
    pub async fn record_attendance(pool: &PgPool, actor: &Actor, req: CreateAttendanceRequest) -> AppResult<Attendance> {
        let mut v = Validator::new();
        check_attendance_status(&mut v, "status", &req.status);
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ctx = active_allocation(&mut tx, req.course_allocation_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;
        ensure_enrolled(&mut tx, req.student_id, &ctx, "student_id").await?;

        let record = sqlx::query_as::<_, Attendance>(UPSERT_ATTENDANCE)
            .bind(req.student_id)
            .bind(ctx.id)
            .bind(req.date)
            .bind(&req.status)
            .bind(req.note.as_deref())
            .bind(actor.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Takes the register for an allocation on one date.
    pub async fn record_attendance_bulk(
        pool: &PgPool,
        actor: &Actor,
        req: BulkAttendanceRequest,
    ) -> AppResult<Vec<Attendance>> {
        let mut v = Validator::new();
        v.check(!req.records.is_empty(), "records", "This list may not be empty.");
        let mut seen = HashSet::new();
        for (i, entry) in req.records.iter().enumerate() {
            check_attendance_status(&mut v, &format!("records[{i}].status"), &entry.status);
            v.check(
                seen.insert(entry.student_id),
                &format!("records[{i}].student_id"),
                "Duplicate student in this request.",
            );
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ctx = active_allocation(&mut tx, req.course_allocation_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;
        for (i, entry) in req.records.iter().enumerate() {
            ensure_enrolled(&mut tx, entry.student_id, &ctx, &format!("records[{i}].student_id")).await?;
        }

        let mut records = Vec::with_capacity(req.records.len());
        for entry in &req.records {
            let record = sqlx::query_as::<_, Attendance>(UPSERT_ATTENDANCE)
                .bind(entry.student_id)
                .bind(ctx.id)
                .bind(req.date)
                .bind(&entry.status)
                .bind(entry.note.as_deref())
                .bind(actor.id)
                .fetch_one(&mut *tx)
                .await?;
            records.push(record);
        }
        tx.commit().await?;
        tracing::info!(
            "attendance for {} students recorded on {} for allocation {} by {}",
            records.len(),
            req.date,
            ctx.id,
            actor.id
        );
        Ok(records)
    }

    pub async fn update_attendance(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateAttendanceRequest,
    ) -> AppResult<Attendance> {
        let mut v = Validator::new();
        if let Some(status) = req.status.as_deref() {
            check_attendance_status(&mut v, "status", status);
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        let (ctx, _) = row_context(&mut tx, &ATTENDANCE, id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        let record = sqlx::query_as::<_, Attendance>(
            "UPDATE attendance
             SET status = COALESCE($2, status),
                 note = CASE WHEN $3 THEN $4 ELSE note END,
                 recorded_by = $5,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.status)
        .bind(req.note.is_some())
        .bind(req.note.flatten())
        .bind(actor.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn set_attendance_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &ATTENDANCE, id, active, |actor, ctx, _| can_teach(actor, ctx)).await
    }

    // ── Lesson plans ────────────────────────────────────────────────────

    pub async fn list_lesson_plans(pool: &PgPool, actor: &Actor, q: &CourseworkListQuery) -> AppResult<Page<LessonPlan>> {
        list_rows(pool, &LESSON_PLANS, actor, q).await
    }

    pub async fn get_lesson_plan(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<LessonPlan> {
        get_row(pool, &LESSON_PLANS, actor, id).await
    }

    pub async fn create_lesson_plan(pool: &PgPool, actor: &Actor, req: CreateLessonPlanRequest) -> AppResult<LessonPlan> {
        let status = req.status.unwrap_or_else(|| "draft".to_string());
        let mut v = Validator::new();
        v.require(&req.title, "title");
        v.check(LESSON_PLAN_STATUSES.contains(&status.as_str()), "status", "Select a valid status.");
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ctx = active_allocation(&mut tx, req.course_allocation_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        let plan = sqlx::query_as::<_, LessonPlan>(
            "INSERT INTO lesson_plans (course_allocation_id, teacher_id, title, objectives, content, plan_date, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(ctx.id)
        .bind(ctx.teacher_id)
        .bind(req.title.trim())
        .bind(req.objectives.as_deref())
        .bind(req.content.as_deref())
        .bind(req.plan_date)
        .bind(&status)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn update_lesson_plan(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateLessonPlanRequest,
    ) -> AppResult<LessonPlan> {
        let mut v = Validator::new();
        if let Some(title) = req.title.as_deref() {
            v.require(title, "title");
        }
        if let Some(status) = req.status.as_deref() {
            v.check(LESSON_PLAN_STATUSES.contains(&status), "status", "Select a valid status.");
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        let (ctx, author) = row_context(&mut tx, &LESSON_PLANS, id).await?;
        rbac::ensure(can_edit_authored(actor, &ctx, author))?;

        let plan = sqlx::query_as::<_, LessonPlan>(
            "UPDATE lesson_plans
             SET title = COALESCE($2, title),
                 objectives = CASE WHEN $3 THEN $4 ELSE objectives END,
                 content = CASE WHEN $5 THEN $6 ELSE content END,
                 plan_date = COALESCE($7, plan_date),
                 status = COALESCE($8, status),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.title.as_deref().map(str::trim))
        .bind(req.objectives.is_some())
        .bind(req.objectives.flatten())
        .bind(req.content.is_some())
        .bind(req.content.flatten())
        .bind(req.plan_date)
        .bind(req.status)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn set_lesson_plan_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &LESSON_PLANS, id, active, can_edit_authored).await
    }

    // ── Learning materials ──────────────────────────────────────────────

    pub async fn list_materials(
        pool: &PgPool,
        actor: &Actor,
        q: &CourseworkListQuery,
    ) -> AppResult<Page<LearningMaterial>> {
        list_rows(pool, &MATERIALS, actor, q).await
    }

    pub async fn get_material(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<LearningMaterial> {
        get_row(pool, &MATERIALS, actor, id).await
    }

    pub async fn create_material(
        pool: &PgPool,
        actor: &Actor,
        req: CreateLearningMaterialRequest,
    ) -> AppResult<LearningMaterial> {
        let mut v = Validator::new();
        v.require(&req.material_code, "material_code").require(&req.title, "title");
        v.check(valid_file_url(&req.file_url), "file_url", "Enter a valid URL.");
        v.finish()?;

        let mut tx = pool.begin().await?;
        let ctx = active_allocation(&mut tx, req.course_allocation_id).await?;
        rbac::ensure(can_teach(actor, &ctx))?;

        let material = sqlx::query_as::<_, LearningMaterial>(
            "INSERT INTO learning_materials (course_allocation_id, uploaded_by, material_code, title, description, file_url)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(ctx.id)
        .bind(actor.id)
        .bind(req.material_code.trim())
        .bind(req.title.trim())
        .bind(req.description.as_deref())
        .bind(req.file_url.trim())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(material)
    }

    pub async fn update_material(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateLearningMaterialRequest,
    ) -> AppResult<LearningMaterial> {
        let mut v = Validator::new();
        if let Some(code) = req.material_code.as_deref() {
            v.require(code, "material_code");
        }
        if let Some(title) = req.title.as_deref() {
            v.require(title, "title");
        }
        if let Some(url) = req.file_url.as_deref() {
            v.check(valid_file_url(url), "file_url", "Enter a valid URL.");
        }
        v.finish()?;

        let mut tx = pool.begin().await?;
        let (ctx, uploader) = row_context(&mut tx, &MATERIALS, id).await?;
        rbac::ensure(can_teach(actor, &ctx) || can_edit_authored(actor, &ctx, uploader))?;

        let material = sqlx::query_as::<_, LearningMaterial>(
            "UPDATE learning_materials
             SET material_code = COALESCE($2, material_code),
                 title = COALESCE($3, title),
                 description = CASE WHEN $4 THEN $5 ELSE description END,
                 file_url = COALESCE($6, file_url),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.material_code.as_deref().map(str::trim))
        .bind(req.title.as_deref().map(str::trim))
        .bind(req.description.is_some())
        .bind(req.description.flatten())
        .bind(req.file_url.as_deref().map(str::trim))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(material)
    }

    pub async fn set_material_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        set_row_active(pool, actor, &MATERIALS, id, active, |actor, ctx, uploader| {
            can_teach(actor, ctx) || can_edit_authored(actor, ctx, uploader)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole, school: Uuid) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role,
            work_stream_id: Some(Uuid::new_v4()),
            school_id: Some(school),
        }
    }

    fn ctx(teacher: Uuid, school: Uuid) -> AllocationContext {
        AllocationContext {
            id: Uuid::new_v4(),
            teacher_id: teacher,
            class_room_id: Uuid::new_v4(),
            academic_year_id: Uuid::new_v4(),
            school_id: school,
            work_stream_id: Uuid::new_v4(),
        }
    }

    fn render(l: &Listing, actor: &Actor, q: &CourseworkListQuery) -> String {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT 1{} WHERE TRUE", l.from));
        push_filters(&mut qb, l, actor, q).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn scores_stay_within_full_mark() {
        assert!(score_in_range(0.0, 20.0));
        assert!(score_in_range(20.0, 20.0));
        assert!(!score_in_range(20.5, 20.0));
        assert!(!score_in_range(-1.0, 20.0));
        assert!(!score_in_range(f64::NAN, 20.0));
    }

    #[test]
    fn only_the_allocation_teacher_teaches() {
        let school = Uuid::new_v4();
        let teacher = actor(UserRole::Teacher, school);
        let colleague = actor(UserRole::Teacher, school);
        let own = ctx(teacher.id, school);
        assert!(can_teach(&teacher, &own));
        assert!(!can_teach(&colleague, &own));

        let mut manager = actor(UserRole::ManagerSchool, school);
        assert!(can_teach(&manager, &own));
        manager.school_id = Some(Uuid::new_v4());
        assert!(!can_teach(&manager, &own));
    }

    #[test]
    fn authored_rows_follow_their_author() {
        let school = Uuid::new_v4();
        let author = actor(UserRole::Teacher, school);
        let successor = actor(UserRole::Teacher, school);
        let allocation = ctx(successor.id, school);
        assert!(can_edit_authored(&author, &allocation, Some(author.id)));
        assert!(!can_edit_authored(&successor, &allocation, Some(author.id)));
    }

    #[test]
    fn students_see_their_own_marks() {
        let student = actor(UserRole::Student, Uuid::new_v4());
        let sql = render(&MARKS, &student, &CourseworkListQuery::default());
        assert!(sql.contains("AND x.student_id IN ($1)"));
        assert!(sql.contains("AND x.is_active"));
    }

    #[test]
    fn students_see_materials_of_enrolled_classes() {
        let student = actor(UserRole::Student, Uuid::new_v4());
        let sql = render(&MATERIALS, &student, &CourseworkListQuery::default());
        assert!(sql.contains("x.course_allocation_id IN (SELECT ca.id FROM course_allocations ca"));
    }

    #[test]
    fn lesson_plans_are_staff_only() {
        let guardian = actor(UserRole::Guardian, Uuid::new_v4());
        assert!(render(&LESSON_PLANS, &guardian, &CourseworkListQuery::default()).contains("AND FALSE"));
    }

    #[test]
    fn date_filters_apply_where_dated() {
        let q = CourseworkListQuery {
            date_from: chrono::NaiveDate::from_ymd_opt(2025, 1, 1),
            student_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let admin = actor(UserRole::Admin, Uuid::new_v4());
        let sql = render(&ATTENDANCE, &admin, &q);
        assert!(sql.contains("x.date >= "));
        assert!(sql.contains("x.student_id = "));
        let sql = render(&ASSIGNMENTS, &admin, &q);
        assert!(!sql.contains(">="));
        assert!(!sql.contains("student_id"));
    }

    #[test]
    fn file_urls() {
        assert!(valid_file_url("https://cdn.example.org/a.pdf"));
        assert!(valid_file_url("/media/a.pdf"));
        assert!(!valid_file_url("a.pdf"));
        assert!(!valid_file_url("/"));
    }
}
