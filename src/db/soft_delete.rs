use sqlx::PgConnection;
use uuid::Uuid;

/// Tables carrying the `is_active` / `deactivated_at` / `deactivated_by` columns.
/// Table names are interpolated into SQL, so only these fixed names are ever used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDeletable {
    WorkStream,
    School,
    User,
    AcademicYear,
    Grade,
    Course,
    ClassRoom,
    Teacher,
    Student,
    Guardian,
    Secretary,
    Enrollment,
    CourseAllocation,
    Assignment,
    Mark,
    Attendance,
    LessonPlan,
    LearningMaterial,
    Configuration,
    Message,
}

impl SoftDeletable {
    pub fn table(self) -> &'static str {
        match self {
            SoftDeletable::WorkStream => "work_streams",
            SoftDeletable::School => "schools",
            SoftDeletable::User => "users",
            SoftDeletable::AcademicYear => "academic_years",
            SoftDeletable::Grade => "grades",
            SoftDeletable::Course => "courses",
            SoftDeletable::ClassRoom => "class_rooms",
            SoftDeletable::Teacher => "teachers",
            SoftDeletable::Student => "students",
            SoftDeletable::Guardian => "guardians",
            SoftDeletable::Secretary => "secretaries",
            SoftDeletable::Enrollment => "student_enrollments",
            SoftDeletable::CourseAllocation => "course_allocations",
            SoftDeletable::Assignment => "assignments",
            SoftDeletable::Mark => "marks",
            SoftDeletable::Attendance => "attendance",
            SoftDeletable::LessonPlan => "lesson_plans",
            SoftDeletable::LearningMaterial => "learning_materials",
            SoftDeletable::Configuration => "system_configurations",
            SoftDeletable::Message => "messages",
        }
    }

    /// Profile tables are keyed by their user id.
    pub fn key_column(self) -> &'static str {
        match self {
            SoftDeletable::Teacher
            | SoftDeletable::Student
            | SoftDeletable::Guardian
            | SoftDeletable::Secretary => "user_id",
            _ => "id",
        }
    }

    fn has_updated_at(self) -> bool {
        !matches!(self, SoftDeletable::Message)
    }
}

/// Marks a row inactive. Returns false when no row matched.
pub async fn deactivate(
    conn: &mut PgConnection,
    entity: SoftDeletable,
    id: Uuid,
    by: Uuid,
) -> Result<bool, sqlx::Error> {
    let touch = if entity.has_updated_at() { ", updated_at = NOW()" } else { "" };
    let res = sqlx::query(&format!(
        "UPDATE {table} SET is_active = FALSE, deactivated_at = NOW(), deactivated_by = $2{touch}
         WHERE {key} = $1",
        table = entity.table(),
        key = entity.key_column(),
    ))
    .bind(id)
    .bind(by)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Clears the soft-delete bookkeeping. Returns false when no row matched.
pub async fn activate(
    conn: &mut PgConnection,
    entity: SoftDeletable,
    id: Uuid,
) -> Result<bool, sqlx::Error> {
    let touch = if entity.has_updated_at() { ", updated_at = NOW()" } else { "" };
    let res = sqlx::query(&format!(
        "UPDATE {table} SET is_active = TRUE, deactivated_at = NULL, deactivated_by = NULL{touch}
         WHERE {key} = $1",
        table = entity.table(),
        key = entity.key_column(),
    ))
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_keyed_by_user_id() {
        assert_eq!(SoftDeletable::Student.key_column(), "user_id");
        assert_eq!(SoftDeletable::Secretary.key_column(), "user_id");
        assert_eq!(SoftDeletable::ClassRoom.key_column(), "id");
        assert_eq!(SoftDeletable::Enrollment.table(), "student_enrollments");
    }
}
