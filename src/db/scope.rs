//! Organisational scope of an actor and its translation into SQL predicates.

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    models::{auth::Actor, user::UserRole},
};

/// What an actor is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    WorkStream(Uuid),
    School(Uuid),
    /// A student sees records about itself.
    Own(Uuid),
    /// A guardian sees records about its linked students.
    GuardianOf(Uuid),
    /// A manager or staff member without an assignment sees nothing.
    Nothing,
}

impl Scope {
    pub fn for_actor(actor: &Actor) -> AppResult<Scope> {
        let scope = match actor.role {
            UserRole::Admin => Scope::All,
            UserRole::ManagerWorkstream => actor.work_stream_id.map_or(Scope::Nothing, Scope::WorkStream),
            UserRole::ManagerSchool | UserRole::Teacher | UserRole::Secretary => {
                actor.school_id.map_or(Scope::Nothing, Scope::School)
            }
            UserRole::Student => Scope::Own(actor.id),
            UserRole::Guardian => Scope::GuardianOf(actor.id),
            UserRole::Guest => return Err(AppError::forbidden()),
        };
        Ok(scope)
    }

    /// Appends ` AND <predicate>` restricting rows to this scope.
    pub fn push_filter(&self, qb: &mut QueryBuilder<'_, Postgres>, cols: &ScopeColumns) {
        match *self {
            Scope::All => {}
            Scope::Nothing => {
                qb.push(" AND FALSE");
            }
            Scope::WorkStream(ws) => match (cols.work_stream, cols.school) {
                (Some(w), Some(s)) => {
                    qb.push(format!(" AND ({w} = "))
                        .push_bind(ws)
                        .push(format!(" OR {s} IN (SELECT id FROM schools WHERE work_stream_id = "))
                        .push_bind(ws)
                        .push("))");
                }
                (Some(w), None) => {
                    qb.push(format!(" AND {w} = ")).push_bind(ws);
                }
                (None, Some(s)) => {
                    qb.push(format!(" AND {s} IN (SELECT id FROM schools WHERE work_stream_id = "))
                        .push_bind(ws)
                        .push(")");
                }
                (None, None) => {
                    qb.push(" AND FALSE");
                }
            },
            Scope::School(school) => match cols.school {
                Some(s) => {
                    qb.push(format!(" AND {s} = ")).push_bind(school);
                }
                None => {
                    qb.push(" AND FALSE");
                }
            },
            Scope::Own(id) => push_student_filter(qb, cols, StudentSet::Own(id)),
            Scope::GuardianOf(id) => push_student_filter(qb, cols, StudentSet::ChildrenOf(id)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Scope::All)
    }
}

/// Column expressions used to scope a query. Entities without a student link
/// are invisible to student and guardian scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeColumns {
    pub work_stream: Option<&'static str>,
    pub school: Option<&'static str>,
    /// Column holding the student the row is about.
    pub person: Option<&'static str>,
    /// Classroom column; students see classrooms they are enrolled in.
    pub class_room: Option<&'static str>,
    /// Course allocation column; visible when the student is enrolled in its classroom.
    pub allocation: Option<&'static str>,
    /// Course column; visible when the course is taught in an enrolled classroom.
    pub course: Option<&'static str>,
}

impl ScopeColumns {
    pub fn school(col: &'static str) -> Self {
        Self {
            work_stream: None,
            school: Some(col),
            person: None,
            class_room: None,
            allocation: None,
            course: None,
        }
    }

    pub fn with_person(mut self, col: &'static str) -> Self {
        self.person = Some(col);
        self
    }

    pub fn with_class_room(mut self, col: &'static str) -> Self {
        self.class_room = Some(col);
        self
    }

    pub fn with_allocation(mut self, col: &'static str) -> Self {
        self.allocation = Some(col);
        self
    }

    pub fn with_course(mut self, col: &'static str) -> Self {
        self.course = Some(col);
        self
    }
}

enum StudentSet {
    Own(Uuid),
    ChildrenOf(Uuid),
}

fn push_student_set(qb: &mut QueryBuilder<'_, Postgres>, set: &StudentSet) {
    match *set {
        StudentSet::Own(id) => {
            qb.push("(").push_bind(id).push(")");
        }
        StudentSet::ChildrenOf(guardian) => {
            qb.push("(SELECT student_id FROM guardian_student_links WHERE guardian_id = ")
                .push_bind(guardian)
                .push(")");
        }
    }
}

const ENROLLED_ALLOCATIONS: &str = "SELECT ca.id FROM course_allocations ca
     JOIN student_enrollments se
       ON se.class_room_id = ca.class_room_id AND se.academic_year_id = ca.academic_year_id
     WHERE ca.is_active AND se.is_active AND se.student_id IN ";

const ENROLLED_COURSES: &str = "SELECT ca.course_id FROM course_allocations ca
     JOIN student_enrollments se
       ON se.class_room_id = ca.class_room_id AND se.academic_year_id = ca.academic_year_id
     WHERE ca.is_active AND se.is_active AND se.student_id IN ";

fn push_student_filter(qb: &mut QueryBuilder<'_, Postgres>, cols: &ScopeColumns, set: StudentSet) {
    if let Some(p) = cols.person {
        qb.push(format!(" AND {p} IN "));
        push_student_set(qb, &set);
    } else if let Some(c) = cols.class_room {
        qb.push(format!(
            " AND {c} IN (SELECT class_room_id FROM student_enrollments WHERE is_active AND student_id IN "
        ));
        push_student_set(qb, &set);
        qb.push(")");
    } else if let Some(a) = cols.allocation {
        qb.push(format!(" AND {a} IN ({ENROLLED_ALLOCATIONS}"));
        push_student_set(qb, &set);
        qb.push(")");
    } else if let Some(c) = cols.course {
        qb.push(format!(" AND {c} IN ({ENROLLED_COURSES}"));
        push_student_set(qb, &set);
        qb.push(")");
    } else {
        qb.push(" AND FALSE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole, ws: Option<Uuid>, school: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "someone@example.org".into(),
            full_name: "Some One".into(),
            role,
            work_stream_id: ws,
            school_id: school,
        }
    }

    #[test]
    fn scope_follows_role() {
        let ws = Uuid::new_v4();
        let school = Uuid::new_v4();

        assert_eq!(Scope::for_actor(&actor(UserRole::Admin, None, None)).unwrap(), Scope::All);
        assert_eq!(
            Scope::for_actor(&actor(UserRole::ManagerWorkstream, Some(ws), None)).unwrap(),
            Scope::WorkStream(ws)
        );
        for role in [UserRole::ManagerSchool, UserRole::Teacher, UserRole::Secretary] {
            assert_eq!(
                Scope::for_actor(&actor(role, Some(ws), Some(school))).unwrap(),
                Scope::School(school)
            );
        }
        let student = actor(UserRole::Student, None, Some(school));
        assert_eq!(Scope::for_actor(&student).unwrap(), Scope::Own(student.id));
        let guardian = actor(UserRole::Guardian, None, None);
        assert_eq!(Scope::for_actor(&guardian).unwrap(), Scope::GuardianOf(guardian.id));
    }

    #[test]
    fn unassigned_managers_see_nothing() {
        assert_eq!(
            Scope::for_actor(&actor(UserRole::ManagerWorkstream, None, None)).unwrap(),
            Scope::Nothing
        );
        assert_eq!(
            Scope::for_actor(&actor(UserRole::ManagerSchool, Some(Uuid::new_v4()), None)).unwrap(),
            Scope::Nothing
        );
    }

    #[test]
    fn guests_are_denied() {
        let err = Scope::for_actor(&actor(UserRole::Guest, None, None)).unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }

    fn render(scope: Scope, cols: ScopeColumns) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM t WHERE TRUE");
        scope.push_filter(&mut qb, &cols);
        qb.sql().to_string()
    }

    #[test]
    fn workstream_scope_covers_direct_and_school_membership() {
        let cols = ScopeColumns {
            work_stream: Some("u.work_stream_id"),
            ..ScopeColumns::school("u.school_id")
        };
        let sql = render(Scope::WorkStream(Uuid::new_v4()), cols);
        assert!(sql.contains("u.work_stream_id = $1"));
        assert!(sql.contains("u.school_id IN (SELECT id FROM schools WHERE work_stream_id = $2)"));
    }

    #[test]
    fn school_scope_without_school_column_matches_nothing() {
        let sql = render(Scope::School(Uuid::new_v4()), ScopeColumns::default());
        assert!(sql.ends_with("AND FALSE"));
    }

    #[test]
    fn student_scopes_use_the_most_direct_link() {
        let own = render(
            Scope::Own(Uuid::new_v4()),
            ScopeColumns::school("m.school_id").with_person("m.student_id"),
        );
        assert!(own.ends_with("AND m.student_id IN ($1)"));

        let children = render(
            Scope::GuardianOf(Uuid::new_v4()),
            ScopeColumns::school("c.school_id").with_class_room("c.id"),
        );
        assert!(children.contains("c.id IN (SELECT class_room_id FROM student_enrollments"));
        assert!(children.contains("guardian_student_links WHERE guardian_id = $1"));

        let hidden = render(Scope::Own(Uuid::new_v4()), ScopeColumns::school("g.school_id"));
        assert!(hidden.ends_with("AND FALSE"));
    }
}
