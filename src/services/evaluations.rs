use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::{
        pagination::{Page, PageParams},
        scope::{Scope, ScopeColumns},
    },
    errors::{AppError, AppResult, Validator},
    models::{
        auth::Actor,
        school::SchoolRef,
        support::{CreateEvaluationRequest, EvaluationListQuery, StaffEvaluation, UpdateEvaluationRequest},
        user::UserRole,
    },
    services::rbac,
};

pub const MAX_SCORE: f64 = 10.0;

fn check(v: &mut Validator, start: NaiveDate, end: NaiveDate, score: f64) {
    v.check(start <= end, "period_end", "The period cannot end before it starts.");
    v.check(
        score.is_finite() && (0.0..=MAX_SCORE).contains(&score),
        "score",
        "Score must be between 0 and 10.",
    );
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, actor: &Actor, q: &EvaluationListQuery) -> AppResult<()> {
    match actor.role {
        // A teacher reads its own evaluations, nobody else's.
        UserRole::Teacher => {
            qb.push(" AND e.teacher_id = ").push_bind(actor.id);
        }
        UserRole::Admin | UserRole::ManagerWorkstream | UserRole::ManagerSchool => {
            Scope::for_actor(actor)?.push_filter(qb, &ScopeColumns::school("e.school_id"));
        }
        _ => return Err(AppError::forbidden()),
    }
    if let Some(teacher) = q.teacher_id {
        qb.push(" AND e.teacher_id = ").push_bind(teacher);
    }
    if let Some(school) = q.school_id {
        qb.push(" AND e.school_id = ").push_bind(school);
    }
    Ok(())
}

async fn evaluation_school(pool: &PgPool, id: Uuid) -> AppResult<(StaffEvaluation, SchoolRef)> {
    let evaluation = sqlx::query_as::<_, StaffEvaluation>("SELECT * FROM staff_evaluations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Evaluation"))?;
    let school = sqlx::query_as::<_, SchoolRef>("SELECT id, work_stream_id FROM schools WHERE id = $1")
        .bind(evaluation.school_id)
        .fetch_one(pool)
        .await?;
    Ok((evaluation, school))
}

pub struct EvaluationService;

impl EvaluationService {
    pub async fn list(pool: &PgPool, actor: &Actor, q: &EvaluationListQuery) -> AppResult<Page<StaffEvaluation>> {
        let page = PageParams::new(q.page, q.page_size);

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM staff_evaluations e WHERE TRUE");
        push_filters(&mut count_qb, actor, q)?;
        let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT e.* FROM staff_evaluations e WHERE TRUE");
        push_filters(&mut qb, actor, q)?;
        qb.push(" ORDER BY e.created_at DESC");
        page.push_limit(&mut qb);
        let rows = qb.build_query_as::<StaffEvaluation>().fetch_all(pool).await?;

        Ok(page.wrap(count, rows))
    }

    pub async fn get(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<StaffEvaluation> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT e.* FROM staff_evaluations e WHERE e.id = ");
        qb.push_bind(id);
        push_filters(&mut qb, actor, &EvaluationListQuery::default())?;
        qb.build_query_as::<StaffEvaluation>()
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Evaluation"))
    }

    /// The evaluation is filed under the teacher's current school, which the
    /// evaluator must manage.
    pub async fn create(pool: &PgPool, actor: &Actor, req: CreateEvaluationRequest) -> AppResult<StaffEvaluation> {
        let mut v = Validator::new();
        check(&mut v, req.period_start, req.period_end, req.score);
        v.finish()?;

        let school: Option<SchoolRef> = sqlx::query_as(
            "SELECT s.id, s.work_stream_id FROM teachers t
             JOIN users u ON u.id = t.user_id
             JOIN schools s ON s.id = u.school_id
             WHERE t.user_id = $1 AND t.is_active",
        )
        .bind(req.teacher_id)
        .fetch_optional(pool)
        .await?;
        let school = school.ok_or_else(|| AppError::field("teacher_id", "Select an active teacher."))?;
        rbac::ensure(rbac::can_manage_school(actor, school))?;

        let evaluation = sqlx::query_as::<_, StaffEvaluation>(
            "INSERT INTO staff_evaluations (evaluator_id, teacher_id, school_id, period_start, period_end, score, comments)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(actor.id)
        .bind(req.teacher_id)
        .bind(school.id)
        .bind(req.period_start)
        .bind(req.period_end)
        .bind(req.score)
        .bind(req.comments.as_deref())
        .fetch_one(pool)
        .await?;
        tracing::info!("evaluation {} of teacher {} filed by {}", evaluation.id, evaluation.teacher_id, actor.id);
        Ok(evaluation)
    }

    pub async fn update(
        pool: &PgPool,
        actor: &Actor,
        id: Uuid,
        req: UpdateEvaluationRequest,
    ) -> AppResult<StaffEvaluation> {
        let (current, school) = evaluation_school(pool, id).await?;
        rbac::ensure(current.evaluator_id == actor.id || rbac::can_manage_school(actor, school))?;

        let mut v = Validator::new();
        check(
            &mut v,
            req.period_start.unwrap_or(current.period_start),
            req.period_end.unwrap_or(current.period_end),
            req.score.unwrap_or(current.score),
        );
        v.finish()?;

        let evaluation = sqlx::query_as::<_, StaffEvaluation>(
            "UPDATE staff_evaluations
             SET period_start = COALESCE($2, period_start),
                 period_end = COALESCE($3, period_end),
                 score = COALESCE($4, score),
                 comments = CASE WHEN $5 THEN $6 ELSE comments END
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(req.period_start)
        .bind(req.period_end)
        .bind(req.score)
        .bind(req.comments.is_some())
        .bind(req.comments.flatten())
        .fetch_one(pool)
        .await?;
        Ok(evaluation)
    }

    /// Only the evaluator or an admin removes an evaluation.
    pub async fn delete(pool: &PgPool, actor: &Actor, id: Uuid) -> AppResult<()> {
        let (current, _) = evaluation_school(pool, id).await?;
        rbac::ensure(current.evaluator_id == actor.id || actor.is_admin())?;
        sqlx::query("DELETE FROM staff_evaluations WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

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
    fn period_and_score_bounds() {
        let mut v = Validator::new();
        check(&mut v, date(1), date(1), 10.0);
        assert!(v.finish().is_ok());
        check(&mut v, date(2), date(1), 5.0);
        assert!(v.finish().is_err());
        check(&mut v, date(1), date(2), 10.5);
        assert!(v.finish().is_err());
        check(&mut v, date(1), date(2), -0.1);
        assert!(v.finish().is_err());
    }

    #[test]
    fn teachers_read_only_their_own() {
        let teacher = actor(UserRole::Teacher);
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM staff_evaluations e WHERE TRUE");
        push_filters(&mut qb, &teacher, &EvaluationListQuery::default()).unwrap();
        assert!(qb.sql().ends_with("AND e.teacher_id = $1"));
    }

    #[test]
    fn other_staff_are_refused() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1");
        assert!(push_filters(&mut qb, &actor(UserRole::Secretary), &EvaluationListQuery::default()).is_err());
    }
}
