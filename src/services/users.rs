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
        user::{normalize_email, CreateUserRequest, UpdateUserRequest, User, UserListQuery, UserRole},
    },
    services::{
        auth::AuthService,
        metrics,
        rbac::{self, Placement},
        schools::SchoolService,
    },
};

pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn validate_password(password: &str, field: &str) -> AppResult<()> {
    Validator::new()
        .check(
            password.chars().count() >= MIN_PASSWORD_LENGTH,
            field,
            "Password must be at least 8 characters long.",
        )
        .finish()
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

/// Everything needed to create an account of any role.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub password: String,
    pub role: UserRole,
    pub work_stream_id: Option<Uuid>,
    pub school_id: Option<Uuid>,
    pub replace_manager: bool,
}

impl From<CreateUserRequest> for NewAccount {
    fn from(r: CreateUserRequest) -> Self {
        Self {
            email: r.email,
            full_name: r.full_name,
            phone: r.phone,
            password: r.password,
            role: r.role,
            work_stream_id: r.work_stream_id,
            school_id: r.school_id,
            replace_manager: r.replace_manager,
        }
    }
}

fn user_scope() -> ScopeColumns {
    ScopeColumns {
        work_stream: Some("u.work_stream_id"),
        ..ScopeColumns::school("u.school_id")
    }
}

/// Admin sees everyone and managers the users of their organisation. Teachers
/// and secretaries also see the accounts of their school whose role they may
/// create; everybody else only themselves.
fn push_visibility(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor) -> AppResult<()> {
    match actor.role {
        UserRole::Admin => {}
        UserRole::ManagerWorkstream | UserRole::ManagerSchool => {
            Scope::for_actor(actor)?.push_filter(qb, &user_scope());
        }
        role => {
            let managed: Vec<String> = rbac::creatable_roles(role).iter().map(|r| r.as_str().to_string()).collect();
            match actor.school_id {
                Some(school) if !managed.is_empty() => {
                    qb.push(" AND (u.id = ")
                        .push_bind(actor.id)
                        .push(" OR (u.school_id = ")
                        .push_bind(school)
                        .push(" AND u.role = ANY(")
                        .push_bind(managed)
                        .push(")))");
                }
                _ => {
                    qb.push(" AND u.id = ").push_bind(actor.id);
                }
            }
        }
    }
    Ok(())
}

/// Whether the actor may look at deactivated accounts it can otherwise see.
fn sees_inactive(actor: &Actor) -> bool {
    !rbac::creatable_roles(actor.role).is_empty()
}

fn push_list_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &UserListQuery) -> AppResult<()> {
    // the user directory is for managers; staff list their accounts through the profile endpoints
    if actor.is_admin() || actor.role.is_manager() {
        push_visibility(qb, actor)?;
    } else {
        qb.push(" AND u.id = ").push_bind(actor.id);
    }

    let may_see_inactive = actor.role == UserRole::Admin || actor.role.is_manager();
    match (may_see_inactive, q.is_active) {
        (true, Some(active)) => {
            qb.push(" AND u.is_active = ").push_bind(active);
        }
        (true, None) if q.include_inactive => {}
        _ => {
            qb.push(" AND u.is_active");
        }
    }

    if let Some(search) = q.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        qb.push(" AND (u.email ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR u.full_name ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(role) = q.role {
        qb.push(" AND u.role = ").push_bind(role.as_str());
    }
    if let Some(ws) = q.work_stream_id {
        qb.push(" AND u.work_stream_id = ").push_bind(ws);
    }
    if let Some(school) = q.school_id {
        qb.push(" AND u.school_id = ").push_bind(school);
    }
    Ok(())
}

pub struct UserService;

impl UserService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &UserListQuery) -> AppResult<Page<User>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users u WHERE TRUE");
        push_list_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT u.* FROM users u WHERE TRUE");
        push_list_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY u.full_name, u.email");
        page.push_limit(&mut qb);
        let users = qb.build_query_as::<User>().fetch_all(pool).await?;

        Ok(page.wrap(count, users))
    }

    /// A user visible to the actor, inactive ones included for managers.
    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<User> {
        let mut conn = pool.acquire().await?;
        Self::get_visible(&mut conn, actor, id).await
    }

    async fn get_visible(conn: &mut PgConnection, actor: &Actor, id: Uuid) -> AppResult<User> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT u.* FROM users u WHERE u.id = ");
        qb.push_bind(id);
        push_visibility(&mut qb, actor)?;
        if !sees_inactive(actor) {
            qb.push(" AND u.is_active");
        }
        qb.build_query_as::<User>()
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::not_found("User"))
    }

    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateUserRequest) -> AppResult<User> {
        let mut tx = pool.begin().await?;
        let user = Self::create_account(&mut tx, actor, req.into()).await?;
        tx.commit().await?;
        tracing::info!("user {} created with role {} by {}", user.id, user.role, actor.id);
        Ok(user)
    }

    /// Creates the user row for any role: creation matrix, organisation scope,
    /// capacity and the single-manager rule are all enforced here. Runs on the
    /// caller's transaction so profile inserts commit or roll back with it.
    pub async fn create_account(conn: &mut PgConnection, actor: &Actor, acc: NewAccount) -> AppResult<User> {
        rbac::ensure(rbac::can_create_role(actor.role, acc.role))?;

        let email = normalize_email(&acc.email);
        let full_name = acc.full_name.trim().to_string();
        Validator::new()
            .require(&email, "email")
            .check(email.is_empty() || looks_like_email(&email), "email", "Enter a valid email address.")
            .require(&full_name, "full_name")
            .check(full_name.chars().count() <= 150, "full_name", "Ensure this field has at most 150 characters.")
            .check(
                acc.password.chars().count() >= MIN_PASSWORD_LENGTH,
                "password",
                "Password must be at least 8 characters long.",
            )
            .finish()?;

        let school = match acc.school_id {
            Some(id) => Some(require_school(&mut *conn, id).await?),
            None => None,
        };
        let placement = rbac::place_account(actor, acc.work_stream_id, school)?;

        Self::ensure_email_free(&mut *conn, &email, None).await?;
        if let Some(ws) = placement.work_stream_id {
            ensure_workstream_capacity(&mut *conn, ws, None).await?;
        }
        if let (UserRole::Student, Some(school_id)) = (acc.role, placement.school_id) {
            ensure_school_capacity(&mut *conn, school_id, None).await?;
        }

        let password_hash = AuthService::hash_password(&acc.password)?;
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, email, full_name, phone, password_hash, role, work_stream_id, school_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&full_name)
        .bind(acc.phone.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        .bind(&password_hash)
        .bind(acc.role.as_str())
        .bind(placement.work_stream_id)
        .bind(placement.school_id)
        .fetch_one(&mut *conn)
        .await?;

        sync_manager_slots(&mut *conn, user.id, acc.role, placement, acc.replace_manager).await?;

        metrics::USERS_CREATED_COUNTER
            .with_label_values(&[acc.role.as_str()])
            .inc();
        Ok(user)
    }

    pub async fn update(pool: &PgPool, actor: &Actor, id: Uuid, req: UpdateUserRequest) -> AppResult<User> {
        let mut tx = pool.begin().await?;
        let user = Self::update_account(&mut tx, actor, id, req).await?;
        tx.commit().await?;
        Ok(user)
    }

    pub async fn update_account(
        conn: &mut PgConnection,
        actor: &Actor,
        id: Uuid,
        req: UpdateUserRequest,
    ) -> AppResult<User> {
        let current = Self::get_visible(&mut *conn, actor, id).await?;
        let current_role = current.role();
        let is_self = current.id == actor.id;

        if !is_self {
            rbac::ensure(rbac::can_create_role(actor.role, current_role))?;
        }
        let changes_org = req.role.is_some_and(|r| r != current_role)
            || req.work_stream_id.is_some()
            || req.school_id.is_some();
        if is_self && changes_org && !actor.is_admin() {
            return Err(AppError::PermissionDenied(
                "You cannot change your own role or organisation.".into(),
            ));
        }

        let role = req.role.unwrap_or(current_role);
        if role != current_role {
            rbac::ensure(rbac::can_create_role(actor.role, role))?;
        }

        let mut validator = Validator::new();
        let email = req.email.as_deref().map(normalize_email);
        if let Some(email) = &email {
            validator.check(looks_like_email(email), "email", "Enter a valid email address.");
        }
        let full_name = req.full_name.as_deref().map(str::trim).map(str::to_string);
        if let Some(name) = &full_name {
            validator.require(name, "full_name");
        }
        if let Some(pw) = &req.password {
            validator.check(
                pw.chars().count() >= MIN_PASSWORD_LENGTH,
                "password",
                "Password must be at least 8 characters long.",
            );
        }
        validator.finish()?;

        if let Some(email) = &email {
            Self::ensure_email_free(&mut *conn, email, Some(id)).await?;
        }

        // Resolve the new organisation: absent keys keep the current values.
        let school_id = req.school_id.unwrap_or(current.school_id);
        let requested_ws = match (req.work_stream_id, req.school_id) {
            (Some(ws), _) => ws,
            (None, Some(Some(_))) => None,
            (None, _) => current.work_stream_id,
        };
        let placement = if changes_org {
            let school = match school_id {
                Some(sid) => Some(require_school(&mut *conn, sid).await?),
                None => None,
            };
            rbac::place_account(actor, requested_ws, school)?
        } else {
            Placement {
                work_stream_id: current.work_stream_id,
                school_id: current.school_id,
            }
        };

        if current.is_active {
            if let Some(ws) = placement.work_stream_id {
                if Some(ws) != current.work_stream_id {
                    ensure_workstream_capacity(&mut *conn, ws, Some(id)).await?;
                }
            }
            if let (UserRole::Student, Some(s)) = (role, placement.school_id) {
                if Some(s) != current.school_id {
                    ensure_school_capacity(&mut *conn, s, Some(id)).await?;
                }
            }
        }

        let password_hash = match &req.password {
            Some(pw) => Some(AuthService::hash_password(pw)?),
            None => None,
        };

        let user = sqlx::query_as::<_, User>(
            "UPDATE users
             SET email = COALESCE($2, email),
                 full_name = COALESCE($3, full_name),
                 phone = CASE WHEN $4 THEN $5 ELSE phone END,
                 role = $6,
                 work_stream_id = $7,
                 school_id = $8,
                 password_hash = COALESCE($9, password_hash),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(email)
        .bind(full_name)
        .bind(req.phone.is_some())
        .bind(req.phone.flatten())
        .bind(role.as_str())
        .bind(placement.work_stream_id)
        .bind(placement.school_id)
        .bind(password_hash)
        .fetch_one(&mut *conn)
        .await?;

        if changes_org || req.replace_manager {
            sync_manager_slots(&mut *conn, id, role, placement, req.replace_manager).await?;
        }
        Ok(user)
    }

    pub async fn deactivate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        if id == actor.id {
            return Err(AppError::BadRequest("You cannot deactivate your own account.".into()));
        }
        let mut tx = pool.begin().await?;
        let target = Self::get_visible(&mut tx, actor, id).await?;
        rbac::ensure(rbac::can_create_role(actor.role, target.role()))?;
        deactivate_account(&mut tx, id, actor.id).await?;
        tx.commit().await?;
        tracing::info!("user {id} deactivated by {}", actor.id);
        Ok(())
    }

    pub async fn activate(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<User> {
        let mut tx = pool.begin().await?;
        let target = Self::get_visible(&mut tx, actor, id).await?;
        rbac::ensure(rbac::can_create_role(actor.role, target.role()))?;
        if !target.is_active {
            if let Some(ws) = target.work_stream_id {
                ensure_workstream_capacity(&mut tx, ws, Some(id)).await?;
            }
        }
        activate_account(&mut tx, id).await?;
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(user)
    }

    /// Hard delete, admin only.
    pub async fn delete(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        rbac::require_admin(actor)?;
        if id == actor.id {
            return Err(AppError::BadRequest("You cannot delete your own account.".into()));
        }
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("User"));
        }
        tracing::warn!("user {id} permanently deleted by {}", actor.id);
        Ok(())
    }

    async fn ensure_email_free(conn: &mut PgConnection, email: &str, except: Option<Uuid>) -> AppResult<()> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(email) = $1 AND id IS DISTINCT FROM $2)",
        )
        .bind(email)
        .bind(except)
        .fetch_one(&mut *conn)
        .await?;
        if taken {
            return Err(AppError::field("email", "A user with this email already exists."));
        }
        Ok(())
    }
}

async fn require_school(conn: &mut PgConnection, id: Uuid) -> AppResult<SchoolRef> {
    SchoolService::load_ref(&mut *conn, id)
        .await?
        .ok_or_else(|| AppError::field("school_id", "Select a valid, active school."))
}

/// Soft-deletes a user with its profiles, revokes its sessions and frees the
/// manager slots it held.
pub async fn deactivate_account(conn: &mut PgConnection, id: Uuid, by: Uuid) -> AppResult<()> {
    if !soft_delete::deactivate(&mut *conn, SoftDeletable::User, id, by).await? {
        return Err(AppError::not_found("User"));
    }
    for profile in [
        SoftDeletable::Teacher,
        SoftDeletable::Student,
        SoftDeletable::Guardian,
        SoftDeletable::Secretary,
    ] {
        soft_delete::deactivate(&mut *conn, profile, id, by).await?;
    }
    sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    release_managed(&mut *conn, id, None).await?;
    Ok(())
}

pub async fn activate_account(conn: &mut PgConnection, id: Uuid) -> AppResult<()> {
    if !soft_delete::activate(&mut *conn, SoftDeletable::User, id).await? {
        return Err(AppError::not_found("User"));
    }
    for profile in [
        SoftDeletable::Teacher,
        SoftDeletable::Student,
        SoftDeletable::Guardian,
        SoftDeletable::Secretary,
    ] {
        soft_delete::activate(&mut *conn, profile, id).await?;
    }
    Ok(())
}

// ─── Capacity ────────────────────────────────────────────────────────────────

pub fn has_capacity(capacity: i64, active: i64) -> bool {
    active < capacity
}

/// Active users of a workstream (directly or through one of its schools) must
/// stay below its capacity. `except` excludes a user already counted.
pub async fn ensure_workstream_capacity(conn: &mut PgConnection, ws: Uuid, except: Option<Uuid>) -> AppResult<()> {
    let row: Option<(i32, bool, i64)> = sqlx::query_as(
        "SELECT w.capacity, w.is_active,
                (SELECT COUNT(*) FROM users u
                  WHERE u.is_active
                    AND u.id IS DISTINCT FROM $2
                    AND (u.work_stream_id = w.id
                         OR u.school_id IN (SELECT id FROM schools WHERE work_stream_id = w.id)))
         FROM work_streams w WHERE w.id = $1",
    )
    .bind(ws)
    .bind(except)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        None | Some((_, false, _)) => Err(AppError::field("work_stream_id", "Select a valid, active workstream.")),
        Some((capacity, true, active)) if !has_capacity(capacity as i64, active) => Err(AppError::field(
            "work_stream",
            format!("The workstream has reached its capacity of {capacity} users."),
        )),
        Some(_) => Ok(()),
    }
}

/// Active students of a school must stay below its optional capacity.
pub async fn ensure_school_capacity(conn: &mut PgConnection, school: Uuid, except: Option<Uuid>) -> AppResult<()> {
    let row: Option<(Option<i32>, i64)> = sqlx::query_as(
        "SELECT s.capacity,
                (SELECT COUNT(*) FROM students st
                  WHERE st.school_id = s.id AND st.is_active AND st.user_id IS DISTINCT FROM $2)
         FROM schools s WHERE s.id = $1",
    )
    .bind(school)
    .bind(except)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        None => Err(AppError::field("school_id", "Select a valid, active school.")),
        Some((Some(capacity), active)) if !has_capacity(capacity as i64, active) => Err(AppError::field(
            "school_id",
            format!("The school has reached its capacity of {capacity} students."),
        )),
        Some(_) => Ok(()),
    }
}

// ─── Single-manager rule ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedUnit {
    WorkStream,
    School,
}

impl ManagedUnit {
    fn table(self) -> &'static str {
        match self {
            ManagedUnit::WorkStream => "work_streams",
            ManagedUnit::School => "schools",
        }
    }

    /// Column on `users` linking a member to the unit; also the error field.
    fn user_column(self) -> &'static str {
        match self {
            ManagedUnit::WorkStream => "work_stream_id",
            ManagedUnit::School => "school_id",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ManagedUnit::WorkStream => "workstream",
            ManagedUnit::School => "school",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// Unassigned, held by an inactive user, or already held by the candidate.
    Take,
    /// Held by another active manager that must be displaced.
    Replace(Uuid),
    Refuse,
}

/// Decides whether `candidate` may take a manager slot currently held by
/// `holder` (id and whether that account is active).
pub fn manager_slot(holder: Option<(Uuid, bool)>, candidate: Uuid, replace: bool) -> SlotDecision {
    match holder {
        Some((id, true)) if id != candidate => {
            if replace {
                SlotDecision::Replace(id)
            } else {
                SlotDecision::Refuse
            }
        }
        _ => SlotDecision::Take,
    }
}

/// Makes `user_id` the manager of a workstream or school, releasing whatever
/// other unit of the same kind it managed before.
pub async fn assign_manager(
    conn: &mut PgConnection,
    unit: ManagedUnit,
    unit_id: Uuid,
    user_id: Uuid,
    replace: bool,
) -> AppResult<()> {
    let table = unit.table();
    let holder: Option<(Option<Uuid>, Option<bool>)> = sqlx::query_as(&format!(
        "SELECT t.manager_id, u.is_active
         FROM {table} t LEFT JOIN users u ON u.id = t.manager_id
         WHERE t.id = $1"
    ))
    .bind(unit_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((manager_id, manager_active)) = holder else {
        return Err(AppError::field(unit.user_column(), format!("Select a valid {}.", unit.label())));
    };
    let holder = manager_id.map(|id| (id, manager_active.unwrap_or(false)));

    match manager_slot(holder, user_id, replace) {
        SlotDecision::Refuse => {
            return Err(AppError::field(
                unit.user_column(),
                format!("This {} already has a manager.", unit.label()),
            ));
        }
        SlotDecision::Replace(old) => {
            sqlx::query(&format!(
                "UPDATE users SET {col} = NULL, updated_at = NOW() WHERE id = $1",
                col = unit.user_column()
            ))
            .bind(old)
            .execute(&mut *conn)
            .await?;
            tracing::info!("{} {unit_id}: manager {old} replaced by {user_id}", unit.label());
        }
        SlotDecision::Take => {}
    }

    release_managed(&mut *conn, user_id, Some((unit, unit_id))).await?;
    sqlx::query(&format!(
        "UPDATE {table} SET manager_id = $2, updated_at = NOW() WHERE id = $1"
    ))
    .bind(unit_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clears `manager_id` on every workstream and school managed by the user,
/// except `keep`.
pub async fn release_managed(
    conn: &mut PgConnection,
    user_id: Uuid,
    keep: Option<(ManagedUnit, Uuid)>,
) -> AppResult<()> {
    for unit in [ManagedUnit::WorkStream, ManagedUnit::School] {
        let keep_id = keep.filter(|(u, _)| *u == unit).map(|(_, id)| id);
        sqlx::query(&format!(
            "UPDATE {table} SET manager_id = NULL, updated_at = NOW()
             WHERE manager_id = $1 AND id IS DISTINCT FROM $2",
            table = unit.table()
        ))
        .bind(user_id)
        .bind(keep_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Brings the manager columns in line with a user's role and placement.
pub async fn sync_manager_slots(
    conn: &mut PgConnection,
    user_id: Uuid,
    role: UserRole,
    placement: Placement,
    replace: bool,
) -> AppResult<()> {
    match (role, placement.work_stream_id, placement.school_id) {
        (UserRole::ManagerWorkstream, Some(ws), _) => {
            assign_manager(conn, ManagedUnit::WorkStream, ws, user_id, replace).await
        }
        (UserRole::ManagerSchool, _, Some(school)) => {
            assign_manager(conn, ManagedUnit::School, school, user_id, replace).await
        }
        _ => release_managed(conn, user_id, None).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_is_taken() {
        assert_eq!(manager_slot(None, Uuid::new_v4(), false), SlotDecision::Take);
    }

    #[test]
    fn own_slot_is_kept() {
        let me = Uuid::new_v4();
        assert_eq!(manager_slot(Some((me, true)), me, false), SlotDecision::Take);
    }

    #[test]
    fn inactive_holder_does_not_block() {
        assert_eq!(
            manager_slot(Some((Uuid::new_v4(), false)), Uuid::new_v4(), false),
            SlotDecision::Take
        );
    }

    #[test]
    fn active_holder_blocks_unless_replacing() {
        let holder = Uuid::new_v4();
        let candidate = Uuid::new_v4();
        assert_eq!(manager_slot(Some((holder, true)), candidate, false), SlotDecision::Refuse);
        assert_eq!(
            manager_slot(Some((holder, true)), candidate, true),
            SlotDecision::Replace(holder)
        );
    }

    #[test]
    fn capacity_is_exclusive_upper_bound() {
        assert!(has_capacity(10, 9));
        assert!(!has_capacity(10, 10));
        assert!(!has_capacity(1, 5));
    }

    #[test]
    fn password_policy() {
        assert!(validate_password("longenough", "password").is_ok());
        assert!(matches!(
            validate_password("short", "new_password"),
            Err(AppError::Validation(f)) if f.contains_key("new_password")
        ));
    }

    fn actor(role: UserRole, school: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "staff@example.org".into(),
            full_name: "Staff Member".into(),
            role,
            work_stream_id: None,
            school_id: school,
        }
    }

    fn visibility_sql(actor: &Actor) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT u.* FROM users u WHERE u.id = ");
        qb.push_bind(Uuid::new_v4());
        push_visibility(&mut qb, actor).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn secretary_sees_managed_roles_of_own_school() {
        let sql = visibility_sql(&actor(UserRole::Secretary, Some(Uuid::new_v4())));
        assert!(sql.ends_with(" AND (u.id = $2 OR (u.school_id = $3 AND u.role = ANY($4)))"));
    }

    #[test]
    fn staff_manage_only_creatable_roles() {
        let roles = rbac::creatable_roles(UserRole::Secretary);
        assert!(roles.contains(&UserRole::Guardian));
        assert!(roles.contains(&UserRole::Student));
        assert!(!roles.contains(&UserRole::Teacher));
        assert!(!roles.contains(&UserRole::Secretary));
    }

    #[test]
    fn unassigned_staff_and_end_users_see_themselves() {
        for a in [
            actor(UserRole::Teacher, None),
            actor(UserRole::Student, Some(Uuid::new_v4())),
            actor(UserRole::Guardian, Some(Uuid::new_v4())),
            actor(UserRole::Guest, None),
        ] {
            assert!(visibility_sql(&a).ends_with(" AND u.id = $2"), "{:?}", a.role);
        }
    }

    #[test]
    fn managers_use_the_organisation_scope() {
        assert_eq!(visibility_sql(&actor(UserRole::Admin, None)), "SELECT u.* FROM users u WHERE u.id = $1");
        let sql = visibility_sql(&actor(UserRole::ManagerSchool, Some(Uuid::new_v4())));
        assert!(sql.ends_with(" AND u.school_id = $2"));
    }

    #[test]
    fn staff_list_only_themselves() {
        let secretary = actor(UserRole::Secretary, Some(Uuid::new_v4()));
        let mut qb = QueryBuilder::<Postgres>::new("SELECT u.* FROM users u WHERE TRUE");
        push_list_filters(&mut qb, &secretary, &UserListQuery::default()).unwrap();
        assert!(qb.sql().starts_with("SELECT u.* FROM users u WHERE TRUE AND u.id = $1 AND u.is_active"));
    }

    #[test]
    fn only_account_creators_see_inactive_users() {
        assert!(sees_inactive(&actor(UserRole::Secretary, None)));
        assert!(sees_inactive(&actor(UserRole::ManagerWorkstream, None)));
        assert!(!sees_inactive(&actor(UserRole::Student, None)));
        assert!(!sees_inactive(&actor(UserRole::Guardian, None)));
    }

    #[test]
    fn email_shape() {
        assert!(looks_like_email("ann@school.org"));
        assert!(!looks_like_email("ann.school.org"));
        assert!(!looks_like_email("@school.org"));
        assert!(!looks_like_email("ann@localhost"));
    }
}
