//! Key/value settings at global, workstream and school level. A lookup walks
//! school, then workstream, then global and returns the first active match.

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        soft_delete::{self, SoftDeletable},
    },
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        configuration::{
            ConfigurationListQuery, CreateConfigurationRequest, ResolvedConfiguration, SystemConfiguration,
            UpdateConfigurationRequest,
        },
        user::UserRole,
    },
    services::{rbac, schools::SchoolService},
};

/// Picks the most specific row: the school's, then the workstream's, then the
/// global one.
pub fn pick_cascade<'a>(
    rows: &'a [SystemConfiguration],
    school_id: Option<Uuid>,
    work_stream_id: Option<Uuid>,
) -> Option<&'a SystemConfiguration> {
    let active = || rows.iter().filter(|r| r.is_active);
    school_id
        .and_then(|s| active().find(|r| r.school_id == Some(s)))
        .or_else(|| {
            work_stream_id.and_then(|w| active().find(|r| r.work_stream_id == Some(w) && r.school_id.is_none()))
        })
        .or_else(|| active().find(|r| r.work_stream_id.is_none() && r.school_id.is_none()))
}

fn lookup_work_stream(given: Option<Uuid>, school_ws: Option<Uuid>) -> Option<Uuid> {
    given.or(school_ws)
}

/// Rows readable by the actor; other roles have no access at all.
fn push_visibility(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor) -> AppResult<()> {
    match actor.role {
        UserRole::Admin => {}
        UserRole::ManagerWorkstream => {
            let Some(ws) = actor.work_stream_id else {
                qb.push(" AND FALSE");
                return Ok(());
            };
            qb.push(" AND ((c.work_stream_id IS NULL AND c.school_id IS NULL) OR c.work_stream_id = ")
                .push_bind(ws)
                .push(" OR c.school_id IN (SELECT id FROM schools WHERE work_stream_id = ")
                .push_bind(ws)
                .push("))");
        }
        UserRole::ManagerSchool => {
            qb.push(" AND ((c.work_stream_id IS NULL AND c.school_id IS NULL)");
            if let Some(ws) = actor.work_stream_id {
                qb.push(" OR c.work_stream_id = ").push_bind(ws);
            }
            if let Some(school) = actor.school_id {
                qb.push(" OR c.school_id = ").push_bind(school);
            }
            qb.push(")");
        }
        _ => return Err(AppError::forbidden()),
    }
    Ok(())
}

/// Whether the actor may write a row at this level.
pub fn can_manage_level(actor: &Actor, work_stream_id: Option<Uuid>, school_id: Option<Uuid>) -> bool {
    match actor.role {
        UserRole::Admin => true,
        UserRole::ManagerWorkstream => {
            school_id.is_none() && work_stream_id.is_some() && work_stream_id == actor.work_stream_id
        }
        UserRole::ManagerSchool => school_id.is_some() && school_id == actor.school_id,
        _ => false,
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &ConfigurationListQuery) -> AppResult<()> {
    push_visibility(qb, actor)?;
    if !q.include_inactive {
        qb.push(" AND c.is_active");
    }
    if let Some(key) = q.config_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        qb.push(" AND c.config_key = ").push_bind(key.to_string());
    }
    if let Some(ws) = q.work_stream_id {
        qb.push(" AND c.work_stream_id = ").push_bind(ws);
    }
    if let Some(school) = q.school_id {
        qb.push(" AND c.school_id = ").push_bind(school);
    }
    Ok(())
}

async fn load(conn: &mut PgConnection, id: Uuid) -> AppResult<SystemConfiguration> {
    sqlx::query_as::<_, SystemConfiguration>("SELECT * FROM system_configurations WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("Configuration"))
}

pub struct ConfigurationService;

impl ConfigurationService {
    pub async fn list(
        pool: &PgPool,
        actor: &Actor,
        q: &ConfigurationListQuery,
    ) -> AppResult<Page<SystemConfiguration>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM system_configurations c WHERE TRUE");
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT c.* FROM system_configurations c WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY c.config_key, c.school_id NULLS FIRST, c.work_stream_id NULLS FIRST");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<SystemConfiguration>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<SystemConfiguration> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT c.* FROM system_configurations c WHERE c.id = ");
        qb.push_bind(id);
        push_visibility(&mut qb, actor)?;
        qb.build_query_as::<SystemConfiguration>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Configuration"))
    }

    pub async fn create(
        pool: &PgPool,
        actor: &Actor,
        req: CreateConfigurationRequest,
    ) -> AppResult<SystemConfiguration> {
        Validator::new()
            .require(&req.config_key, "config_key")
            .check(
                req.work_stream_id.is_none() || req.school_id.is_none(),
                "school_id",
                "A configuration targets either a workstream or a school, not both.",
            )
            .finish()?;
        rbac::ensure(can_manage_level(actor, req.work_stream_id, req.school_id))?;

        let mut tx = pool.begin().await?;
        if let Some(school) = req.school_id {
            SchoolService::require_ref(&mut *tx, school, "school_id").await?;
        }
        if let Some(ws) = req.work_stream_id {
            let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM work_streams WHERE id = $1")
                .bind(ws)
                .fetch_optional(&mut *tx)
                .await?;
            if active != Some(true) {
                return Err(AppError::field("work_stream_id", "Select a valid, active workstream."));
            }
        }

        let config = sqlx::query_as::<_, SystemConfiguration>(
            "INSERT INTO system_configurations
                (config_key, config_value, description, work_stream_id, school_id, updated_by)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(req.config_key.trim())
        .bind(&req.config_value)
        .bind(req.description.as_deref())
        .bind(req.work_stream_id)
        .bind(req.school_id)
        .bind(actor.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!("configuration {} ({}) created by {}", config.config_key, config.id, actor.id);
        Ok(config)
    }

    pub async fn update(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateConfigurationRequest,
    ) -> AppResult<SystemConfiguration> {
        let mut tx = pool.begin().await?;
        let current = load(&mut tx, id).await?;
        rbac::ensure(can_manage_level(actor, current.work_stream_id, current.school_id))?;

        let config = sqlx::query_as::<_, SystemConfiguration>(
            "UPDATE system_configurations
             SET config_value = COALESCE($2, config_value),
                 description = CASE WHEN $3 THEN $4 ELSE description END,
                 updated_by = $5,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.config_value)
        .bind(req.description.is_some())
        .bind(req.description.flatten())
        .bind(actor.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(config)
    }

    pub async fn set_active(pool: &PgPool, actor: &Actor, id: Uuid, active: bool) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        let current = load(&mut tx, id).await?;
        rbac::ensure(can_manage_level(actor, current.work_stream_id, current.school_id))?;
        if active {
            soft_delete::activate(&mut tx, SoftDeletable::Configuration, id).await?;
        } else {
            soft_delete::deactivate(&mut tx, SoftDeletable::Configuration, id, actor.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The value in effect for `key`. The school's workstream is used only
    /// when no workstream is passed in.
    pub async fn get_value(
        pool: &PgPool,
        key: &str,
        school_id: Option<Uuid>,
        work_stream_id: Option<Uuid>,
    ) -> AppResult<Option<SystemConfiguration>> {
        let school_ws: Option<Uuid> = match school_id {
            Some(school) => sqlx::query_scalar("SELECT work_stream_id FROM schools WHERE id = $1")
                .bind(school)
                .fetch_optional(pool)
                .await?,
            None => None,
        };
        let work_stream_id = lookup_work_stream(work_stream_id, school_ws);

        let rows = sqlx::query_as::<_, SystemConfiguration>(
            "SELECT * FROM system_configurations
             WHERE config_key = $1 AND is_active
               AND (school_id = $2
                    OR (work_stream_id = $3 AND school_id IS NULL)
                    OR (work_stream_id IS NULL AND school_id IS NULL))",
        )
        .bind(key)
        .bind(school_id)
        .bind(work_stream_id)
        .fetch_all(pool)
        .await?;

        Ok(pick_cascade(&rows, school_id, work_stream_id).cloned())
    }

    /// Resolution on behalf of an actor, restricted to levels it may read.
    pub async fn resolve(
        pool: &PgPool,
        actor: &Actor,
        key: &str,
        school_id: Option<Uuid>,
        work_stream_id: Option<Uuid>,
    ) -> AppResult<ResolvedConfiguration> {
        Validator::new().require(key, "key").finish()?;
        let readable = match actor.role {
            UserRole::Admin => true,
            UserRole::ManagerWorkstream => {
                let ws_ok = work_stream_id.map_or(true, |w| Some(w) == actor.work_stream_id);
                let school_ok = match school_id {
                    Some(s) => SchoolService::load_ref(pool, s)
                        .await?
                        .is_some_and(|s| Some(s.work_stream_id) == actor.work_stream_id),
                    None => true,
                };
                ws_ok && school_ok
            }
            UserRole::ManagerSchool => {
                school_id.map_or(true, |s| Some(s) == actor.school_id)
                    && work_stream_id.map_or(true, |w| Some(w) == actor.work_stream_id)
            }
            _ => false,
        };
        rbac::ensure(readable)?;

        let found = Self::get_value(pool, key.trim(), school_id, work_stream_id).await?;
        Ok(ResolvedConfiguration {
            key: key.trim().to_string(),
            value: found.as_ref().map(|c| c.config_value.clone()),
            level: found.as_ref().map(SystemConfiguration::level),
            configuration_id: found.map(|c| c.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::configuration::ConfigLevel;

    fn row(ws: Option<Uuid>, school: Option<Uuid>, value: &str) -> SystemConfiguration {
        SystemConfiguration {
            id: Uuid::new_v4(),
            config_key: "max_absences".into(),
            config_value: value.into(),
            description: None,
            work_stream_id: ws,
            school_id: school,
            is_active: true,
            updated_by: None,
            deactivated_at: None,
            deactivated_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn actor(role: UserRole, ws: Option<Uuid>, school: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            email: "x@example.org".into(),
            full_name: "X".into(),
            role,
            work_stream_id: ws,
            school_id: school,
        }
    }

    #[test]
    fn most_specific_level_wins() {
        let ws = Uuid::new_v4();
        let school = Uuid::new_v4();
        let rows = vec![row(None, None, "10"), row(Some(ws), None, "8"), row(None, Some(school), "5")];

        let hit = pick_cascade(&rows, Some(school), Some(ws)).unwrap();
        assert_eq!(hit.config_value, "5");
        assert_eq!(hit.level(), ConfigLevel::School);

        let hit = pick_cascade(&rows, Some(Uuid::new_v4()), Some(ws)).unwrap();
        assert_eq!(hit.config_value, "8");

        let hit = pick_cascade(&rows, None, None).unwrap();
        assert_eq!(hit.level(), ConfigLevel::Global);
    }

    #[test]
    fn explicit_workstream_beats_the_schools() {
        let given = Uuid::new_v4();
        let schools = Uuid::new_v4();
        assert_eq!(lookup_work_stream(Some(given), Some(schools)), Some(given));
        assert_eq!(lookup_work_stream(None, Some(schools)), Some(schools));
        assert_eq!(lookup_work_stream(None, None), None);

        let school = Uuid::new_v4();
        let rows = vec![row(Some(schools), None, "school-ws"), row(Some(given), None, "given-ws")];
        let ws = lookup_work_stream(Some(given), Some(schools));
        assert_eq!(pick_cascade(&rows, Some(school), ws).unwrap().config_value, "given-ws");
    }

    #[test]
    fn inactive_rows_are_skipped() {
        let school = Uuid::new_v4();
        let mut school_row = row(None, Some(school), "5");
        school_row.is_active = false;
        let rows = vec![school_row, row(None, None, "10")];
        assert_eq!(pick_cascade(&rows, Some(school), None).unwrap().config_value, "10");
        assert!(pick_cascade(&rows[..1], Some(school), None).is_none());
    }

    #[test]
    fn managers_write_only_their_level() {
        let ws = Uuid::new_v4();
        let school = Uuid::new_v4();
        let wm = actor(UserRole::ManagerWorkstream, Some(ws), None);
        assert!(can_manage_level(&wm, Some(ws), None));
        assert!(!can_manage_level(&wm, None, None));
        assert!(!can_manage_level(&wm, None, Some(school)));

        let sm = actor(UserRole::ManagerSchool, Some(ws), Some(school));
        assert!(can_manage_level(&sm, None, Some(school)));
        assert!(!can_manage_level(&sm, Some(ws), None));

        assert!(can_manage_level(&actor(UserRole::Admin, None, None), None, None));
        assert!(!can_manage_level(&actor(UserRole::Teacher, Some(ws), Some(school)), None, Some(school)));
    }

    #[test]
    fn staff_cannot_read_configuration() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        assert!(push_visibility(&mut qb, &actor(UserRole::Secretary, None, Some(Uuid::new_v4()))).is_err());
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        push_visibility(&mut qb, &actor(UserRole::ManagerSchool, Some(Uuid::new_v4()), Some(Uuid::new_v4()))).unwrap();
        assert!(qb.sql().contains("OR c.work_stream_id = $1 OR c.school_id = $2"));
    }
}
