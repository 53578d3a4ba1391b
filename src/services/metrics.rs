use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter, CounterVec, Gauge, GaugeVec};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters (increment on each event) ────────────────────────────
    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "edutrack_logins_total",
        "Login attempts by role and outcome",
        &["role", "status"]
    ).unwrap();

    pub static ref USERS_CREATED_COUNTER: CounterVec = register_counter_vec!(
        "edutrack_users_created_total",
        "Accounts created by role",
        &["role"]
    ).unwrap();

    pub static ref PASSWORD_RESETS_COUNTER: Counter = register_counter!(
        "edutrack_password_resets_total",
        "Password reset tokens issued"
    ).unwrap();

    pub static ref MESSAGES_COUNTER: Counter = register_counter!(
        "edutrack_messages_sent_total",
        "Messages sent"
    ).unwrap();

    pub static ref NOTIFICATIONS_COUNTER: CounterVec = register_counter_vec!(
        "edutrack_notifications_total",
        "Notifications delivered by fan-out scope",
        &["scope"]
    ).unwrap();

    pub static ref EXPORTS_COUNTER: CounterVec = register_counter_vec!(
        "edutrack_exports_total",
        "Report exports by entity and format",
        &["entity", "format"]
    ).unwrap();

    // ── Business metrics ────────────────────────────────────────────────────
    pub static ref USERS_GAUGE: GaugeVec = register_gauge_vec!(
        "edutrack_users_active",
        "Active users by role",
        &["role"]
    ).unwrap();

    pub static ref SCHOOLS_GAUGE: GaugeVec = register_gauge_vec!(
        "edutrack_schools_active",
        "Active schools by workstream",
        &["workstream"]
    ).unwrap();

    pub static ref ENROLLMENTS_GAUGE: Gauge = register_gauge!(
        "edutrack_enrollments_active",
        "Enrollments currently in the enrolled state"
    ).unwrap();

    pub static ref WORKSTREAMS_GAUGE: Gauge = register_gauge!(
        "edutrack_workstreams_active",
        "Active workstreams"
    ).unwrap();
}

/// Spawn the background metrics collector (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        if let Err(e) = collect(&pool).await {
            warn!("Metrics: initial collection failed: {}", e);
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool).await {
                warn!("Metrics: collection failed: {}", e);
            }
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let users: Vec<(String, i64)> =
        sqlx::query_as("SELECT role, COUNT(*)::BIGINT FROM users WHERE is_active GROUP BY role")
            .fetch_all(pool)
            .await?;
    USERS_GAUGE.reset();
    for (role, count) in users {
        USERS_GAUGE.with_label_values(&[&role]).set(count as f64);
    }

    let schools: Vec<(String, i64)> = sqlx::query_as(
        "SELECT w.slug, COUNT(s.id)::BIGINT
         FROM work_streams w
         LEFT JOIN schools s ON s.work_stream_id = w.id AND s.is_active
         WHERE w.is_active
         GROUP BY w.slug",
    )
    .fetch_all(pool)
    .await?;
    WORKSTREAMS_GAUGE.set(schools.len() as f64);
    SCHOOLS_GAUGE.reset();
    for (slug, count) in &schools {
        SCHOOLS_GAUGE.with_label_values(&[slug]).set(*count as f64);
    }

    let enrollments: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM student_enrollments WHERE is_active AND status = 'enrolled'",
    )
    .fetch_one(pool)
    .await?;
    ENROLLMENTS_GAUGE.set(enrollments as f64);

    info!("Metrics: collected for {} workstream(s)", schools.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::postgres::PgPoolOptions;

    use super::*;

    #[tokio::test]
    async fn collection_surfaces_database_errors() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://edutrack@127.0.0.1:1/edutrack")
            .unwrap();
        assert!(collect(&pool).await.is_err());
    }
}
