//! Dashboards and statistics. Every figure is computed on request from the
//! live tables; nothing is cached.

use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::scope::{Scope, ScopeColumns},
    errors::{AppError, AppResult},
    models::{
        auth::Actor,
        report::{
            AllocationCounts, AttendanceSummary, ClassRoomCounts, CourseAverage, DayCount, GradeCounts,
            LoginActivityQuery, RoleCount, SchoolCounts,
        },
        user::UserRole,
    },
    services::{
        academic::AcademicService, rbac, schools::SchoolService, students::StudentService,
        teachers::TeacherService, workstreams::WorkStreamService,
    },
};

pub const DEFAULT_LOGIN_DAYS: i64 = 7;
pub const MAX_LOGIN_DAYS: i64 = 90;

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Share of attended sessions; late arrivals count as attended.
pub fn attendance_rate(s: &AttendanceSummary) -> f64 {
    if s.total == 0 {
        return 0.0;
    }
    round2((s.present + s.late) as f64 / s.total as f64 * 100.0)
}

pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}

pub fn login_window(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_LOGIN_DAYS).clamp(1, MAX_LOGIN_DAYS)
}

/// One entry per day of the window ending `today`, oldest first.
pub fn zero_fill(today: NaiveDate, days: i64, rows: &[(NaiveDate, i64)]) -> Vec<DayCount> {
    (0..days)
        .rev()
        .map(|back| {
            let date = today - Duration::days(back);
            let count = rows.iter().find(|(d, _)| *d == date).map_or(0, |(_, n)| *n);
            DayCount { date, count }
        })
        .collect()
}

/// What a statistic is about. Each maps to a column of the
/// attendance/marks ⋈ allocation ⋈ classroom ⋈ school join.
#[derive(Debug, Clone, Copy)]
enum Subject {
    WorkStream(Uuid),
    School(Uuid),
    Teacher(Uuid),
    ClassRoom(Uuid),
    Course(Uuid),
    Student(Uuid),
}

impl Subject {
    fn id(self) -> Uuid {
        match self {
            Subject::WorkStream(id)
            | Subject::School(id)
            | Subject::Teacher(id)
            | Subject::ClassRoom(id)
            | Subject::Course(id)
            | Subject::Student(id) => id,
        }
    }

    /// `person` is the student column of the fact table.
    fn column(self, person: &'static str) -> &'static str {
        match self {
            Subject::WorkStream(_) => "s.work_stream_id",
            Subject::School(_) => "cr.school_id",
            Subject::Teacher(_) => "ca.teacher_id",
            Subject::ClassRoom(_) => "ca.class_room_id",
            Subject::Course(_) => "ca.course_id",
            Subject::Student(_) => person,
        }
    }
}

const ATTENDANCE_SUMMARY: &str = "SELECT
        COUNT(*) FILTER (WHERE att.status = 'present') AS present,
        COUNT(*) FILTER (WHERE att.status = 'absent') AS absent,
        COUNT(*) FILTER (WHERE att.status = 'late') AS late,
        COUNT(*) FILTER (WHERE att.status = 'excused') AS excused,
        COUNT(*) AS total
     FROM attendance att
     JOIN course_allocations ca ON ca.id = att.course_allocation_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     JOIN schools s ON s.id = cr.school_id
     WHERE att.is_active AND ";

const MARK_JOINS: &str = "FROM marks m
     JOIN assignments a ON a.id = m.assignment_id
     JOIN course_allocations ca ON ca.id = a.course_allocation_id
     JOIN courses c ON c.id = ca.course_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     JOIN schools s ON s.id = cr.school_id
     WHERE m.is_active AND a.is_active AND ";

async fn attendance_summary(pool: &PgPool, subject: Subject) -> AppResult<AttendanceSummary> {
    let sql = format!("{ATTENDANCE_SUMMARY}{} = $1", subject.column("att.student_id"));
    Ok(sqlx::query_as::<_, AttendanceSummary>(&sql)
        .bind(subject.id())
        .fetch_one(pool)
        .await?)
}

async fn mark_average(pool: &PgPool, subject: Subject) -> AppResult<(i64, Option<f64>)> {
    let sql = format!(
        "SELECT COUNT(m.id), AVG(m.score / a.full_mark * 100) {MARK_JOINS}{} = $1",
        subject.column("m.student_id")
    );
    let (marks, average): (i64, Option<f64>) = sqlx::query_as(&sql).bind(subject.id()).fetch_one(pool).await?;
    Ok((marks, average.map(round2)))
}

async fn course_averages(pool: &PgPool, subject: Subject) -> AppResult<Vec<CourseAverage>> {
    let sql = format!(
        "SELECT c.id AS course_id, c.name, COUNT(m.id) AS marks, AVG(m.score / a.full_mark * 100) AS average
         {MARK_JOINS}{} = $1
         GROUP BY c.id, c.name
         ORDER BY c.name",
        subject.column("m.student_id")
    );
    let mut rows = sqlx::query_as::<_, CourseAverage>(&sql)
        .bind(subject.id())
        .fetch_all(pool)
        .await?;
    for row in &mut rows {
        row.average = row.average.map(round2);
    }
    Ok(rows)
}

async fn performance(pool: &PgPool, subject: Subject) -> AppResult<Value> {
    let attendance = attendance_summary(pool, subject).await?;
    let (marks, average) = mark_average(pool, subject).await?;
    Ok(json!({
        "attendance": attendance,
        "attendance_rate": attendance_rate(&attendance),
        "marks_recorded": marks,
        "average_mark": average,
    }))
}

async fn count(pool: &PgPool, sql: &str, id: Uuid) -> AppResult<i64> {
    Ok(sqlx::query_scalar(sql).bind(id).fetch_one(pool).await?)
}

const SCHOOL_COUNTS: &str = "SELECT s.id AS school_id, s.school_name,
        (SELECT COUNT(*) FROM students st WHERE st.school_id = s.id AND st.is_active) AS students,
        (SELECT COUNT(*) FROM teachers t JOIN users u ON u.id = t.user_id
          WHERE u.school_id = s.id AND t.is_active) AS teachers,
        (SELECT COUNT(*) FROM class_rooms cr WHERE cr.school_id = s.id AND cr.is_active) AS class_rooms
     FROM schools s
     WHERE s.is_active AND s.work_stream_id = $1
     ORDER BY s.school_name";

const GRADE_COUNTS: &str = "SELECT g.id AS grade_id, g.name, g.numeric_level,
        (SELECT COUNT(*) FROM students st WHERE st.grade_id = g.id AND st.is_active) AS students
     FROM grades g
     WHERE g.is_active AND g.school_id = $1
     ORDER BY g.numeric_level";

const CLASS_ROOM_COUNTS: &str = "SELECT cr.id AS class_room_id, cr.classroom_name, cr.capacity,
        (SELECT COUNT(*) FROM student_enrollments se
          WHERE se.class_room_id = cr.id AND se.is_active AND se.status = 'enrolled') AS enrolled
     FROM class_rooms cr
     WHERE cr.is_active AND cr.school_id = $1
     ORDER BY cr.classroom_name";

const ALLOCATION_COUNTS: &str = "SELECT ca.id AS course_allocation_id, c.name AS course_name, cr.classroom_name,
        (SELECT COUNT(*) FROM student_enrollments se
          WHERE se.class_room_id = ca.class_room_id AND se.academic_year_id = ca.academic_year_id
            AND se.is_active AND se.status = 'enrolled') AS enrolled,
        (SELECT COUNT(*) FROM assignments a WHERE a.course_allocation_id = ca.id AND a.is_active) AS assignments
     FROM course_allocations ca
     JOIN courses c ON c.id = ca.course_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     WHERE ca.is_active AND ca.teacher_id = $1
     ORDER BY c.name, cr.classroom_name";

/// Whole-population statistics are for staff; students and guardians only
/// get their own (or their children's) figures.
fn ensure_staff(actor: &Actor) -> AppResult<()> {
    rbac::ensure(actor.role.is_staff())
}

pub struct ReportService;

impl ReportService {
    pub async fn dashboard(pool: &PgPool, actor: &Actor) -> AppResult<Value> {
        let body = match actor.role {
            UserRole::Admin => Self::admin_overview(pool).await?,
            UserRole::ManagerWorkstream => {
                let ws = actor.work_stream_id.ok_or_else(AppError::forbidden)?;
                Self::workstream(pool, actor, ws).await?
            }
            UserRole::ManagerSchool | UserRole::Secretary => {
                let school = actor.school_id.ok_or_else(AppError::forbidden)?;
                Self::school(pool, actor, school).await?
            }
            UserRole::Teacher => Self::teacher(pool, actor, actor.id).await?,
            UserRole::Student => Self::student(pool, actor, actor.id).await?,
            UserRole::Guardian => Self::children(pool, actor).await?,
            UserRole::Guest => return Err(AppError::forbidden()),
        };
        Ok(json!({ "role": actor.role, "dashboard": body }))
    }

    async fn admin_overview(pool: &PgPool) -> AppResult<Value> {
        let users = sqlx::query_as::<_, RoleCount>(
            "SELECT role, COUNT(*) AS count FROM users WHERE is_active GROUP BY role ORDER BY role",
        )
        .fetch_all(pool)
        .await?;
        let (workstreams, schools, enrollments, open_tickets): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM work_streams WHERE is_active),
                (SELECT COUNT(*) FROM schools WHERE is_active),
                (SELECT COUNT(*) FROM student_enrollments WHERE is_active AND status = 'enrolled'),
                (SELECT COUNT(*) FROM support_tickets WHERE status <> 'closed')",
        )
        .fetch_one(pool)
        .await?;
        Ok(json!({
            "workstreams": workstreams,
            "schools": schools,
            "active_enrollments": enrollments,
            "open_tickets": open_tickets,
            "users_by_role": users,
            "total_users": users.iter().map(|r| r.count).sum::<i64>(),
        }))
    }

    async fn children(pool: &PgPool, actor: &Actor) -> AppResult<Value> {
        let children: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT st.user_id, u.full_name
             FROM guardian_student_links l
             JOIN students st ON st.user_id = l.student_id
             JOIN users u ON u.id = st.user_id
             WHERE l.guardian_id = $1 AND st.is_active
             ORDER BY u.full_name",
        )
        .bind(actor.id)
        .fetch_all(pool)
        .await?;

        let mut out = Vec::with_capacity(children.len());
        for (student_id, full_name) in children {
            out.push(json!({
                "student_id": student_id,
                "full_name": full_name,
                "performance": performance(pool, Subject::Student(student_id)).await?,
            }));
        }
        Ok(json!({ "children": out }))
    }

    pub async fn workstream(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        ensure_staff(actor)?;
        let ws = WorkStreamService::get(pool, actor, id).await?;
        let schools = sqlx::query_as::<_, SchoolCounts>(SCHOOL_COUNTS)
            .bind(id)
            .fetch_all(pool)
            .await?;
        let active_users = count(
            pool,
            "SELECT COUNT(*) FROM users
             WHERE is_active AND (work_stream_id = $1 OR school_id IN (SELECT id FROM schools WHERE work_stream_id = $1))",
            id,
        )
        .await?;

        Ok(json!({
            "workstream": { "id": ws.id, "name": ws.name, "capacity": ws.capacity },
            "totals": {
                "schools": schools.len(),
                "students": schools.iter().map(|s| s.students).sum::<i64>(),
                "teachers": schools.iter().map(|s| s.teachers).sum::<i64>(),
                "active_users": active_users,
            },
            "capacity_used": percentage(active_users, i64::from(ws.capacity)),
            "schools": schools,
            "performance": performance(pool, Subject::WorkStream(id)).await?,
        }))
    }

    pub async fn school(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        ensure_staff(actor)?;
        let school = SchoolService::get(pool, actor, id).await?;
        let grades = sqlx::query_as::<_, GradeCounts>(GRADE_COUNTS)
            .bind(id)
            .fetch_all(pool)
            .await?;
        let class_rooms = sqlx::query_as::<_, ClassRoomCounts>(CLASS_ROOM_COUNTS)
            .bind(id)
            .fetch_all(pool)
            .await?;
        let (students, teachers, secretaries, courses): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM students WHERE school_id = $1 AND is_active),
                (SELECT COUNT(*) FROM teachers t JOIN users u ON u.id = t.user_id WHERE u.school_id = $1 AND t.is_active),
                (SELECT COUNT(*) FROM secretaries x JOIN users u ON u.id = x.user_id WHERE u.school_id = $1 AND x.is_active),
                (SELECT COUNT(*) FROM courses WHERE school_id = $1 AND is_active)",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(json!({
            "school": { "id": school.id, "name": school.school_name, "capacity": school.capacity },
            "totals": {
                "students": students,
                "teachers": teachers,
                "secretaries": secretaries,
                "courses": courses,
                "class_rooms": class_rooms.len(),
            },
            "capacity_used": school.capacity.map(|c| percentage(students, i64::from(c))),
            "grades": grades,
            "class_rooms": class_rooms,
            "performance": performance(pool, Subject::School(id)).await?,
        }))
    }

    pub async fn teacher(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        ensure_staff(actor)?;
        let teacher = TeacherService::get(pool, actor, id).await?;
        let allocations = sqlx::query_as::<_, AllocationCounts>(ALLOCATION_COUNTS)
            .bind(id)
            .fetch_all(pool)
            .await?;
        let (marks, lesson_plans, materials): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM marks WHERE graded_by = $1 AND is_active),
                (SELECT COUNT(*) FROM lesson_plans WHERE teacher_id = $1 AND is_active),
                (SELECT COUNT(*) FROM learning_materials WHERE uploaded_by = $1 AND is_active)",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(json!({
            "teacher": { "id": teacher.user_id, "full_name": teacher.full_name },
            "totals": {
                "allocations": allocations.len(),
                "assignments": allocations.iter().map(|a| a.assignments).sum::<i64>(),
                "students_taught": allocations.iter().map(|a| a.enrolled).sum::<i64>(),
                "marks_graded": marks,
                "lesson_plans": lesson_plans,
                "materials": materials,
            },
            "allocations": allocations,
            "performance": performance(pool, Subject::Teacher(id)).await?,
        }))
    }

    pub async fn class_room(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        ensure_staff(actor)?;
        let class_room = AcademicService::get_class_room(pool, actor, id).await?;
        let (enrolled, allocations): (i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM student_enrollments WHERE class_room_id = $1 AND is_active AND status = 'enrolled'),
                (SELECT COUNT(*) FROM course_allocations WHERE class_room_id = $1 AND is_active)",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(json!({
            "class_room": {
                "id": class_room.id,
                "name": class_room.classroom_name,
                "capacity": class_room.capacity,
            },
            "enrolled": enrolled,
            "occupancy": class_room.capacity.map(|c| percentage(enrolled, i64::from(c))),
            "allocations": allocations,
            "courses": course_averages(pool, Subject::ClassRoom(id)).await?,
            "performance": performance(pool, Subject::ClassRoom(id)).await?,
        }))
    }

    pub async fn course(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        ensure_staff(actor)?;
        let course = AcademicService::get_course(pool, actor, id).await?;
        let (allocations, assignments): (i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM course_allocations WHERE course_id = $1 AND is_active),
                (SELECT COUNT(*) FROM assignments a JOIN course_allocations ca ON ca.id = a.course_allocation_id
                  WHERE ca.course_id = $1 AND a.is_active)",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(json!({
            "course": { "id": course.id, "code": course.course_code, "name": course.name },
            "allocations": allocations,
            "assignments": assignments,
            "performance": performance(pool, Subject::Course(id)).await?,
        }))
    }

    /// Visible to staff in scope, the student itself and its guardians.
    pub async fn student(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<Value> {
        let student = StudentService::get(pool, actor, id).await?;
        let enrollments = count(
            pool,
            "SELECT COUNT(*) FROM student_enrollments WHERE student_id = $1 AND is_active",
            id,
        )
        .await?;

        Ok(json!({
            "student": {
                "id": student.user_id,
                "full_name": student.full_name,
                "current_status": student.current_status,
            },
            "enrollments": enrollments,
            "courses": course_averages(pool, Subject::Student(id)).await?,
            "performance": performance(pool, Subject::Student(id)).await?,
        }))
    }

    /// Logins per day over the last `days` days, for the users the actor
    /// manages.
    pub async fn login_activity(pool: &PgPool, actor: &Actor, q: &LoginActivityQuery) -> AppResult<Value> {
        rbac::ensure(actor.is_admin() || actor.role.is_manager())?;
        let days = login_window(q.days);
        let today = Utc::now().date_naive();
        let since = today - Duration::days(days - 1);

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT (h.login_time AT TIME ZONE 'UTC')::date AS day, COUNT(*) AS count
             FROM user_login_history h
             JOIN users u ON u.id = h.user_id
             WHERE (h.login_time AT TIME ZONE 'UTC')::date >= ",
        );
        qb.push_bind(since);
        Scope::for_actor(actor)?.push_filter(
            &mut qb,
            &ScopeColumns {
                work_stream: Some("u.work_stream_id"),
                ..ScopeColumns::school("u.school_id")
            },
        );
        qb.push(" GROUP BY 1 ORDER BY 1");
        let rows = qb.build_query_as::<(NaiveDate, i64)>().fetch_all(pool).await?;

        let series = zero_fill(today, days, &rows);
        Ok(json!({
            "days": days,
            "from": since,
            "to": today,
            "total": series.iter().map(|d| d.count).sum::<i64>(),
            "series": series,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(present: i64, absent: i64, late: i64, excused: i64) -> AttendanceSummary {
        AttendanceSummary {
            present,
            absent,
            late,
            excused,
            total: present + absent + late + excused,
        }
    }

    #[test]
    fn late_counts_as_attended() {
        assert_eq!(attendance_rate(&summary(6, 2, 1, 0)), 77.78);
        assert_eq!(attendance_rate(&summary(1, 0, 1, 0)), 100.0);
        assert_eq!(attendance_rate(&summary(0, 1, 0, 2)), 0.0);
    }

    #[test]
    fn empty_attendance_is_zero() {
        assert_eq!(attendance_rate(&AttendanceSummary::default()), 0.0);
    }

    #[test]
    fn percentages_round_to_two_places() {
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(2, 3), 66.67);
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(round2(87.505_1), 87.51);
    }

    #[test]
    fn login_window_is_bounded() {
        assert_eq!(login_window(None), 7);
        assert_eq!(login_window(Some(30)), 30);
        assert_eq!(login_window(Some(365)), 90);
        assert_eq!(login_window(Some(0)), 1);
        assert_eq!(login_window(Some(-4)), 1);
    }

    #[test]
    fn missing_days_are_filled_with_zero() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let rows = vec![(NaiveDate::from_ymd_opt(2025, 3, 8).unwrap(), 4), (today, 2)];
        let series = zero_fill(today, 4, &rows);

        assert_eq!(series.len(), 4);
        assert_eq!(series[0].date, NaiveDate::from_ymd_opt(2025, 3, 7).unwrap());
        assert_eq!(
            series.iter().map(|d| d.count).collect::<Vec<_>>(),
            vec![0, 4, 0, 2]
        );
    }

    #[test]
    fn subjects_pick_their_column() {
        let id = Uuid::new_v4();
        assert_eq!(Subject::Student(id).column("m.student_id"), "m.student_id");
        assert_eq!(Subject::WorkStream(id).column("m.student_id"), "s.work_stream_id");
        assert_eq!(Subject::Teacher(id).id(), id);
    }

    #[test]
    fn only_staff_see_population_statistics() {
        let mut actor = Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role: UserRole::Student,
            work_stream_id: None,
            school_id: None,
        };
        assert!(ensure_staff(&actor).is_err());
        actor.role = UserRole::Secretary;
        assert!(ensure_staff(&actor).is_ok());
    }
}
