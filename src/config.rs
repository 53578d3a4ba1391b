use std::{env, str::FromStr};

use anyhow::Context;

/// Runtime settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub jwt_expiry_seconds: u64,
    pub jwt_refresh_expiry_days: u64,
    pub host: String,
    pub port: u16,
    /// Frontend origin; login and reset links in emails point here.
    pub app_base_url: String,
    pub password_reset_ttl_minutes: i64,
    /// When set, password-reset responses echo the token (local development only).
    pub debug: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 20)?,
            redis_url: text("REDIS_URL", "redis://127.0.0.1:6379"),
            jwt_secret: required("JWT_SECRET")?,
            jwt_refresh_secret: required("JWT_REFRESH_SECRET")?,
            jwt_expiry_seconds: parsed("JWT_EXPIRY_SECONDS", 900)?,
            jwt_refresh_expiry_days: parsed("JWT_REFRESH_EXPIRY_DAYS", 7)?,
            host: text("HOST", "0.0.0.0"),
            port: parsed("PORT", 8080)?,
            app_base_url: text("APP_BASE_URL", "http://localhost"),
            password_reset_ttl_minutes: parsed("PASSWORD_RESET_TTL_MINUTES", 60)?,
            debug: optional("DEBUG").is_some_and(|v| truthy(&v)),
            smtp_host: optional("SMTP_HOST"),
            smtp_port: optional("SMTP_PORT").and_then(|v| v.parse().ok()),
            smtp_username: optional("SMTP_USERNAME"),
            smtp_password: optional("SMTP_PASSWORD"),
            smtp_from: optional("SMTP_FROM"),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn required(key: &str) -> anyhow::Result<String> {
    optional(key).with_context(|| format!("Missing required env var: {key}"))
}

fn text(key: &str, default: &str) -> String {
    optional(key).unwrap_or_else(|| default.to_string())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("Invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_values() {
        assert!(truthy("TRUE"));
        assert!(truthy(" yes "));
        assert!(!truthy("0"));
        assert!(!truthy("off"));
    }

    #[test]
    fn parsed_falls_back_when_unset() {
        let port: u16 = parsed("EDUTRACK_TEST_UNSET_PORT", 8080).unwrap();
        assert_eq!(port, 8080);
    }
}
