//! Bootstraps an admin account, or promotes an existing account to admin.
//!
//! Usage:
//!   DATABASE_URL=... create-admin --email admin@example.com --full-name "Site Admin" --password '...'

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use edutrack_api::{
    db,
    models::user::normalize_email,
    services::{auth::AuthService, users::validate_password},
};

#[derive(Parser)]
#[command(name = "create-admin", about = "Create or promote an EduTrack admin account")]
struct Args {
    #[arg(long)]
    email: String,

    #[arg(long, default_value = "Administrator")]
    full_name: String,

    /// Falls back to ADMIN_PASSWORD
    #[arg(long)]
    password: Option<String>,

    /// Promote and reset the password when the email already exists
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let args = Args::parse();
    let password = match args.password.or_else(|| std::env::var("ADMIN_PASSWORD").ok()) {
        Some(p) => p,
        None => bail!("--password or ADMIN_PASSWORD is required"),
    };
    validate_password(&password, "password").map_err(|e| anyhow::anyhow!("{e}"))?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL required")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool).await?;

    let email = normalize_email(&args.email);
    let hash = AuthService::hash_password(&password).map_err(|e| anyhow::anyhow!("{e}"))?;

    let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE LOWER(email) = $1")
        .bind(&email)
        .fetch_optional(&pool)
        .await?;

    match existing {
        Some(id) if args.force => {
            sqlx::query(
                "UPDATE users SET role = 'admin', password_hash = $1, work_stream_id = NULL, school_id = NULL,
                        is_active = TRUE, deactivated_at = NULL, deactivated_by = NULL, updated_at = NOW()
                 WHERE id = $2",
            )
            .bind(&hash)
            .bind(id)
            .execute(&pool)
            .await?;
            tracing::info!("Promoted {email} ({id}) to admin");
        }
        Some(_) => bail!("{email} already exists; pass --force to promote it"),
        None => {
            let id: Uuid = sqlx::query_scalar(
                "INSERT INTO users (email, full_name, password_hash, role) VALUES ($1, $2, $3, 'admin') RETURNING id",
            )
            .bind(&email)
            .bind(&args.full_name)
            .bind(&hash)
            .fetch_one(&pool)
            .await?;
            tracing::info!("Created admin {email} ({id})");
        }
    }

    Ok(())
}
