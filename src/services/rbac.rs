//! Role-based permission predicates shared by all services.
//!
//! Reads are filtered through [`crate::db::scope::Scope`]; the predicates here
//! decide whether an actor may mutate objects that belong to a school or
//! workstream.

use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    models::{auth::Actor, school::SchoolRef, user::UserRole},
};

/// Roles each role may create or assign.
pub fn creatable_roles(actor: UserRole) -> &'static [UserRole] {
    use UserRole::*;
    match actor {
        Admin => &[Admin, ManagerWorkstream, ManagerSchool, Teacher, Secretary, Guardian, Student],
        ManagerWorkstream => &[ManagerSchool, Teacher, Secretary, Guardian, Student],
        ManagerSchool => &[Teacher, Secretary, Guardian, Student],
        Teacher | Secretary => &[Guardian, Student],
        Student | Guardian | Guest => &[],
    }
}

pub fn can_create_role(actor: UserRole, target: UserRole) -> bool {
    creatable_roles(actor).contains(&target)
}

pub fn ensure(allowed: bool) -> AppResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

pub fn require_admin(actor: &Actor) -> AppResult<()> {
    ensure(actor.is_admin())
}

/// Admin, or the manager of this workstream.
pub fn can_manage_workstream(actor: &Actor, work_stream_id: Uuid) -> bool {
    match actor.role {
        UserRole::Admin => true,
        UserRole::ManagerWorkstream => actor.work_stream_id == Some(work_stream_id),
        _ => false,
    }
}

/// Admin, the manager of the school's workstream, or the school's manager.
pub fn can_manage_school(actor: &Actor, school: SchoolRef) -> bool {
    match actor.role {
        UserRole::ManagerSchool => actor.school_id == Some(school.id),
        _ => can_manage_workstream(actor, school.work_stream_id),
    }
}

/// School managers plus the school's secretaries: day-to-day administration of
/// enrollments, allocations and profiles.
pub fn can_administer_school(actor: &Actor, school: SchoolRef) -> bool {
    match actor.role {
        UserRole::Secretary => actor.school_id == Some(school.id),
        _ => can_manage_school(actor, school),
    }
}

/// Anyone working in the school, teachers included.
pub fn is_school_staff(actor: &Actor, school: SchoolRef) -> bool {
    match actor.role {
        UserRole::Teacher => actor.school_id == Some(school.id),
        _ => can_administer_school(actor, school),
    }
}

/// Organisation a newly created account lands in, after defaults and scope checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
}

/// Checks that `requested` lies inside the actor's organisation, filling in the
/// actor's own workstream/school when nothing was requested. `school` is the
/// requested school with its workstream, already loaded.
pub fn place_account(
    actor: &Actor,
    requested_ws: Option<Uuid>,
    school: Option<SchoolRef>,
) -> AppResult<Placement> {
    if let (Some(ws), Some(s)) = (requested_ws, school) {
        if ws != s.work_stream_id {
            return Err(AppError::field(
                "work_stream_id",
                "The school does not belong to this workstream.",
            ));
        }
    }
    let work_stream_id = school.map(|s| s.work_stream_id).or(requested_ws);
    let school_id = school.map(|s| s.id);

    match actor.role {
        UserRole::Admin => Ok(Placement { work_stream_id, school_id }),
        UserRole::ManagerWorkstream => {
            let own = actor.work_stream_id.ok_or_else(AppError::forbidden)?;
            match work_stream_id {
                None => Ok(Placement { work_stream_id: Some(own), school_id: None }),
                Some(ws) if ws == own => Ok(Placement { work_stream_id, school_id }),
                Some(_) => Err(AppError::forbidden()),
            }
        }
        UserRole::ManagerSchool | UserRole::Teacher | UserRole::Secretary => {
            let own = actor.school_id.ok_or_else(AppError::forbidden)?;
            match school_id {
                None if requested_ws.is_none() || requested_ws == actor.work_stream_id => Ok(Placement {
                    work_stream_id: actor.work_stream_id,
                    school_id: Some(own),
                }),
                Some(id) if id == own => Ok(Placement { work_stream_id, school_id }),
                _ => Err(AppError::forbidden()),
            }
        }
        UserRole::Student | UserRole::Guardian | UserRole::Guest => Err(AppError::forbidden()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: UserRole, ws: Option<Uuid>, school: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "a@example.org".into(),
            full_name: "A".into(),
            role,
            work_stream_id: ws,
            school_id: school,
        }
    }

    #[test]
    fn role_creation_matrix() {
        use UserRole::*;
        assert!(can_create_role(Admin, Admin));
        assert!(can_create_role(ManagerWorkstream, ManagerSchool));
        assert!(!can_create_role(ManagerWorkstream, ManagerWorkstream));
        assert!(!can_create_role(ManagerSchool, ManagerSchool));
        assert!(can_create_role(ManagerSchool, Secretary));
        assert!(can_create_role(Teacher, Student));
        assert!(!can_create_role(Teacher, Teacher));
        assert!(can_create_role(Secretary, Guardian));
        for role in [Student, Guardian, Guest] {
            assert!(creatable_roles(role).is_empty());
        }
        assert!(!can_create_role(Admin, Guest));
    }

    #[test]
    fn school_management_by_role() {
        let ws = Uuid::new_v4();
        let school = SchoolRef { id: Uuid::new_v4(), work_stream_id: ws };
        let other = SchoolRef { id: Uuid::new_v4(), work_stream_id: Uuid::new_v4() };

        assert!(can_manage_school(&actor(UserRole::Admin, None, None), other));
        assert!(can_manage_school(&actor(UserRole::ManagerWorkstream, Some(ws), None), school));
        assert!(!can_manage_school(&actor(UserRole::ManagerWorkstream, Some(ws), None), other));
        assert!(can_manage_school(&actor(UserRole::ManagerSchool, Some(ws), Some(school.id)), school));
        assert!(!can_manage_school(&actor(UserRole::ManagerSchool, Some(ws), Some(other.id)), school));

        let secretary = actor(UserRole::Secretary, Some(ws), Some(school.id));
        assert!(!can_manage_school(&secretary, school));
        assert!(can_administer_school(&secretary, school));

        let teacher = actor(UserRole::Teacher, Some(ws), Some(school.id));
        assert!(!can_administer_school(&teacher, school));
        assert!(is_school_staff(&teacher, school));
        assert!(!is_school_staff(&actor(UserRole::Student, Some(ws), Some(school.id)), school));
    }

    #[test]
    fn placement_defaults_to_actor_organisation() {
        let ws = Uuid::new_v4();
        let school = Uuid::new_v4();

        let mgr = actor(UserRole::ManagerWorkstream, Some(ws), None);
        assert_eq!(
            place_account(&mgr, None, None).unwrap(),
            Placement { work_stream_id: Some(ws), school_id: None }
        );

        let teacher = actor(UserRole::Teacher, Some(ws), Some(school));
        assert_eq!(
            place_account(&teacher, None, None).unwrap(),
            Placement { work_stream_id: Some(ws), school_id: Some(school) }
        );
    }

    #[test]
    fn placement_rejects_foreign_organisations() {
        let ws = Uuid::new_v4();
        let mgr = actor(UserRole::ManagerWorkstream, Some(ws), None);
        let foreign = SchoolRef { id: Uuid::new_v4(), work_stream_id: Uuid::new_v4() };
        assert!(matches!(
            place_account(&mgr, None, Some(foreign)),
            Err(AppError::PermissionDenied(_))
        ));

        let school_mgr = actor(UserRole::ManagerSchool, Some(ws), Some(Uuid::new_v4()));
        let sibling = SchoolRef { id: Uuid::new_v4(), work_stream_id: ws };
        assert!(place_account(&school_mgr, None, Some(sibling)).is_err());
    }

    #[test]
    fn school_implies_its_workstream() {
        let admin = actor(UserRole::Admin, None, None);
        let school = SchoolRef { id: Uuid::new_v4(), work_stream_id: Uuid::new_v4() };

        let placed = place_account(&admin, None, Some(school)).unwrap();
        assert_eq!(placed.work_stream_id, Some(school.work_stream_id));

        let err = place_account(&admin, Some(Uuid::new_v4()), Some(school)).unwrap_err();
        assert!(matches!(err, AppError::Validation(ref f) if f.contains_key("work_stream_id")));
    }
}
