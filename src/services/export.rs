//! CSV and JSON exports of the main entities, limited to the caller's scope.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::scope::{Scope, ScopeColumns},
    errors::{AppError, AppResult},
    models::{
        auth::Actor,
        report::{ExportEntity, ExportFormat, ExportQuery},
    },
    services::{metrics::EXPORTS_COUNTER, rbac},
};

#[derive(Debug, Serialize, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    full_name: String,
    phone: Option<String>,
    role: String,
    work_stream_id: Option<Uuid>,
    school_id: Option<Uuid>,
    is_active: bool,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
struct StudentRow {
    user_id: Uuid,
    email: String,
    full_name: String,
    school_name: String,
    grade: Option<String>,
    date_of_birth: NaiveDate,
    admission_date: NaiveDate,
    current_status: String,
    is_active: bool,
}

#[derive(Debug, Serialize, FromRow)]
struct TeacherRow {
    user_id: Uuid,
    email: String,
    full_name: String,
    school_name: Option<String>,
    specialization: Option<String>,
    hire_date: NaiveDate,
    employment_status: String,
    years_of_experience: Option<i32>,
    is_active: bool,
}

#[derive(Debug, Serialize, FromRow)]
struct SchoolRow {
    id: Uuid,
    school_name: String,
    workstream: String,
    location: Option<String>,
    capacity: Option<i32>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    is_active: bool,
}

#[derive(Debug, Serialize, FromRow)]
struct EnrollmentRow {
    id: Uuid,
    student_email: String,
    student_name: String,
    classroom_name: String,
    academic_year: String,
    status: String,
    enrolled_at: NaiveDate,
}

#[derive(Debug, Serialize, FromRow)]
struct MarkRow {
    id: Uuid,
    student_email: String,
    student_name: String,
    course_name: String,
    assignment_code: String,
    assignment_title: String,
    score: f64,
    full_mark: f64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
struct AttendanceRow {
    id: Uuid,
    student_email: String,
    student_name: String,
    course_name: String,
    classroom_name: String,
    date: NaiveDate,
    status: String,
    note: Option<String>,
}

const USERS: &str = "SELECT u.id, u.email, u.full_name, u.phone, u.role, u.work_stream_id, u.school_id,
        u.is_active, u.last_login_at, u.created_at
     FROM users u WHERE TRUE";

const STUDENTS: &str = "SELECT st.user_id, u.email, u.full_name, s.school_name, g.name AS grade,
        st.date_of_birth, st.admission_date, st.current_status, st.is_active
     FROM students st
     JOIN users u ON u.id = st.user_id
     JOIN schools s ON s.id = st.school_id
     LEFT JOIN grades g ON g.id = st.grade_id
     WHERE TRUE";

const TEACHERS: &str = "SELECT t.user_id, u.email, u.full_name, s.school_name, t.specialization,
        t.hire_date, t.employment_status, t.years_of_experience, t.is_active
     FROM teachers t
     JOIN users u ON u.id = t.user_id
     LEFT JOIN schools s ON s.id = u.school_id
     WHERE TRUE";

const SCHOOLS: &str = "SELECT s.id, s.school_name, w.name AS workstream, s.location, s.capacity,
        s.contact_email, s.contact_phone, s.is_active
     FROM schools s
     JOIN work_streams w ON w.id = s.work_stream_id
     WHERE TRUE";

const ENROLLMENTS: &str = "SELECT se.id, u.email AS student_email, u.full_name AS student_name,
        cr.classroom_name, ay.academic_year_code AS academic_year, se.status, se.enrolled_at
     FROM student_enrollments se
     JOIN users u ON u.id = se.student_id
     JOIN class_rooms cr ON cr.id = se.class_room_id
     JOIN academic_years ay ON ay.id = se.academic_year_id
     WHERE se.is_active";

const MARKS: &str = "SELECT m.id, u.email AS student_email, u.full_name AS student_name, c.name AS course_name,
        a.assignment_code, a.title AS assignment_title, m.score, a.full_mark, m.updated_at
     FROM marks m
     JOIN users u ON u.id = m.student_id
     JOIN assignments a ON a.id = m.assignment_id
     JOIN course_allocations ca ON ca.id = a.course_allocation_id
     JOIN courses c ON c.id = ca.course_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     WHERE m.is_active";

const ATTENDANCE: &str = "SELECT att.id, u.email AS student_email, u.full_name AS student_name,
        c.name AS course_name, cr.classroom_name, att.date, att.status, att.note
     FROM attendance att
     JOIN users u ON u.id = att.student_id
     JOIN course_allocations ca ON ca.id = att.course_allocation_id
     JOIN courses c ON c.id = ca.course_id
     JOIN class_rooms cr ON cr.id = ca.class_room_id
     WHERE att.is_active";

fn user_columns() -> ScopeColumns {
    ScopeColumns {
        work_stream: Some("u.work_stream_id"),
        ..ScopeColumns::school("u.school_id")
    }
}

/// `{entity}_{YYYYmmdd_HHMMSS}.{ext}`
pub fn export_filename(entity: ExportEntity, format: ExportFormat, now: DateTime<Utc>) -> String {
    format!("{}_{}.{}", entity.as_str(), now.format("%Y%m%d_%H%M%S"), format.extension())
}

pub fn to_csv<T: Serialize>(rows: &[T]) -> AppResult<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in rows {
        wtr.serialize(row).map_err(anyhow::Error::from)?;
    }
    wtr.into_inner()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("csv export: {e}")))
}

fn render<T: Serialize>(rows: &[T], format: ExportFormat) -> AppResult<Vec<u8>> {
    match format {
        ExportFormat::Csv => to_csv(rows),
        ExportFormat::Json => serde_json::to_vec_pretty(rows).map_err(|e| AppError::Internal(e.into())),
    }
}

async fn fetch<T>(pool: &PgPool, actor: &Actor, select: &str, cols: ScopeColumns, order: &str) -> AppResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let mut qb = QueryBuilder::<Postgres>::new(select);
    Scope::for_actor(actor)?.push_filter(&mut qb, &cols);
    qb.push(" ORDER BY ").push(order);
    Ok(qb.build_query_as::<T>().fetch_all(pool).await?)
}

async fn export<T>(
    pool: &PgPool,
    actor: &Actor,
    format: ExportFormat,
    select: &str,
    cols: ScopeColumns,
    order: &str,
) -> AppResult<(usize, Vec<u8>)>
where
    T: for<'r> FromRow<'r, PgRow> + Serialize + Send + Unpin,
{
    let rows: Vec<T> = fetch(pool, actor, select, cols, order).await?;
    Ok((rows.len(), render(&rows, format)?))
}

pub struct ExportFile {
    pub filename: String,
    pub content_type: mime::Mime,
    pub rows: usize,
    pub body: Vec<u8>,
}

pub struct ExportService;

impl ExportService {
    /// Staff only; students and guardians have no export.
    pub async fn export(pool: &PgPool, actor: &Actor, q: &ExportQuery) -> AppResult<ExportFile> {
        rbac::ensure(actor.role.is_staff())?;
        let school = ScopeColumns::school("cr.school_id");

        let (rows, body) = match q.entity {
            ExportEntity::Users => {
                export::<UserRow>(pool, actor, q.format, USERS, user_columns(), "u.created_at").await?
            }
            ExportEntity::Students => {
                export::<StudentRow>(
                    pool,
                    actor,
                    q.format,
                    STUDENTS,
                    ScopeColumns::school("st.school_id"),
                    "s.school_name, u.full_name",
                )
                .await?
            }
            ExportEntity::Teachers => {
                export::<TeacherRow>(pool, actor, q.format, TEACHERS, user_columns(), "u.full_name").await?
            }
            ExportEntity::Schools => {
                let cols = ScopeColumns {
                    work_stream: Some("s.work_stream_id"),
                    ..ScopeColumns::school("s.id")
                };
                export::<SchoolRow>(pool, actor, q.format, SCHOOLS, cols, "w.name, s.school_name").await?
            }
            ExportEntity::Enrollments => {
                export::<EnrollmentRow>(pool, actor, q.format, ENROLLMENTS, school, "se.enrolled_at, u.full_name")
                    .await?
            }
            ExportEntity::Marks => {
                export::<MarkRow>(pool, actor, q.format, MARKS, school, "c.name, a.assignment_code, u.full_name").await?
            }
            ExportEntity::Attendance => {
                export::<AttendanceRow>(pool, actor, q.format, ATTENDANCE, school, "att.date, u.full_name").await?
            }
        };

        EXPORTS_COUNTER
            .with_label_values(&[q.entity.as_str(), q.format.extension()])
            .inc();
        tracing::info!(
            "export of {} {} rows as {} by {}",
            rows,
            q.entity.as_str(),
            q.format.extension(),
            actor.id
        );

        Ok(ExportFile {
            filename: export_filename(q.entity, q.format, Utc::now()),
            content_type: q.format.content_type(),
            rows,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filenames_carry_entity_and_timestamp() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 9, 5, 7).unwrap();
        assert_eq!(
            export_filename(ExportEntity::Marks, ExportFormat::Csv, now),
            "marks_20250131_090507.csv"
        );
        assert_eq!(
            export_filename(ExportEntity::Users, ExportFormat::Json, now),
            "users_20250131_090507.json"
        );
    }

    #[test]
    fn csv_has_header_and_blank_optionals() {
        let rows = vec![SchoolRow {
            id: Uuid::nil(),
            school_name: "North, Primary".into(),
            workstream: "District 1".into(),
            location: None,
            capacity: Some(300),
            contact_email: None,
            contact_phone: None,
            is_active: true,
        }];
        let out = String::from_utf8(to_csv(&rows).unwrap()).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,school_name,workstream,location,capacity,contact_email,contact_phone,is_active"
        );
        assert_eq!(
            lines.next().unwrap(),
            "00000000-0000-0000-0000-000000000000,\"North, Primary\",District 1,,300,,,true"
        );
    }

    #[test]
    fn json_export_is_an_array() {
        let rows: Vec<SchoolRow> = Vec::new();
        let body = render(&rows, ExportFormat::Json).unwrap();
        assert_eq!(body, b"[]");
    }

    #[test]
    fn query_parameters_parse() {
        let q: ExportQuery = serde_json::from_value(serde_json::json!({ "entity": "attendance" })).unwrap();
        assert_eq!(q.entity, ExportEntity::Attendance);
        assert_eq!(q.format, ExportFormat::Csv);
    }
}
