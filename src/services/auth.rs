use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    config::Config,
    errors::{AppError, AppResult},
    middleware::workstream::CurrentWorkStream,
    models::{
        auth::{AccessTokenResponse, Claims, ClientInfo, LoginResponse, RefreshClaims, RefreshToken, RegisterRequest},
        user::{normalize_email, User, UserRole},
    },
    services::{
        audit,
        email::EmailService,
        metrics,
        users::{ensure_workstream_capacity, validate_password, MIN_PASSWORD_LENGTH},
    },
};

const BCRYPT_COST: u32 = 12;
/// Refresh tokens are long random strings; a cheaper cost is enough.
const REFRESH_BCRYPT_COST: u32 = 8;

/// Hex SHA-256 of a token, the form in which reset and refresh tokens are stored.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Roles allowed to sign in to the administration portal.
pub fn portal_role_allowed(role: UserRole) -> bool {
    matches!(role, UserRole::Admin | UserRole::ManagerWorkstream)
}

fn build_reset_url(base_url: &str, token: &str) -> String {
    format!("{}/reset-password?token={token}", base_url.trim_end_matches('/'))
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("Invalid email or password.".into())
}

pub struct AuthService;

impl AuthService {
    pub fn hash_password(password: &str) -> AppResult<String> {
        Ok(bcrypt::hash(password, BCRYPT_COST)?)
    }

    pub fn generate_access_token(
        user_id: Uuid,
        role: UserRole,
        secret: &str,
        ttl_seconds: u64,
    ) -> anyhow::Result<String> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl_seconds as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;
        Ok(token)
    }

    fn generate_refresh_token(user_id: Uuid, secret: &str, ttl_days: u64) -> anyhow::Result<(String, Uuid)> {
        let now = Utc::now().timestamp() as usize;
        let jti = Uuid::new_v4();
        let claims = RefreshClaims {
            sub: user_id.to_string(),
            jti: jti.to_string(),
            iat: now,
            exp: now + (ttl_days * 86400) as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;
        Ok((token, jti))
    }

    fn decode_refresh_token(token: &str, secret: &str) -> AppResult<RefreshClaims> {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode::<RefreshClaims>(token, &key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|_| AppError::Unauthorized("Token is invalid or expired.".into()))
    }

    /// Issues an access/refresh pair and persists the refresh token so it can be revoked.
    async fn issue_tokens(pool: &PgPool, config: &Config, user: User) -> AppResult<LoginResponse> {
        let access_token = Self::generate_access_token(
            user.id,
            user.role(),
            &config.jwt_secret,
            config.jwt_expiry_seconds,
        )?;
        let (refresh_token, jti) =
            Self::generate_refresh_token(user.id, &config.jwt_refresh_secret, config.jwt_refresh_expiry_days)?;

        let hash = bcrypt::hash(token_digest(&refresh_token), REFRESH_BCRYPT_COST)?;
        let expires_at = Utc::now() + chrono::Duration::days(config.jwt_refresh_expiry_days as i64);

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(jti)
        .bind(user.id)
        .bind(hash)
        .bind(expires_at)
        .execute(pool)
        .await?;

        Ok(LoginResponse { access_token, refresh_token, user })
    }

    /// Looks up an active user by email and checks the password.
    async fn authenticate(pool: &PgPool, email: &str, password: &str) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = $1")
            .bind(normalize_email(email))
            .fetch_optional(pool)
            .await?
            .ok_or_else(invalid_credentials)?;

        let valid = bcrypt::verify(password, &user.password_hash).unwrap_or(false);
        if !valid {
            metrics::LOGINS_COUNTER
                .with_label_values(&[user.role.as_str(), "invalid_password"])
                .inc();
            return Err(invalid_credentials());
        }
        if !user.is_active {
            metrics::LOGINS_COUNTER
                .with_label_values(&[user.role.as_str(), "inactive"])
                .inc();
            return Err(AppError::Unauthorized("This account is inactive.".into()));
        }
        Ok(user)
    }

    async fn complete_login(
        pool: &PgPool,
        config: &Config,
        user: User,
        client: ClientInfo,
    ) -> AppResult<LoginResponse> {
        metrics::LOGINS_COUNTER
            .with_label_values(&[user.role.as_str(), "success"])
            .inc();
        audit::record_login(pool.clone(), user.id, client);
        let mut response = Self::issue_tokens(pool, config, user).await?;
        response.user.last_login_at = Some(Utc::now());
        tracing::info!("user {} logged in", response.user.id);
        Ok(response)
    }

    /// Self-registration on the portal creates a guest account.
    pub async fn portal_register(pool: &PgPool, req: &RegisterRequest) -> AppResult<User> {
        let email = Self::validate_registration(pool, req).await?;
        let password_hash = Self::hash_password(&req.password)?;

        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, full_name, password_hash, role)
             VALUES ($1, $2, $3, 'guest')
             RETURNING *",
        )
        .bind(&email)
        .bind(req.full_name.trim())
        .bind(&password_hash)
        .fetch_one(pool)
        .await?;

        metrics::USERS_CREATED_COUNTER
            .with_label_values(&[UserRole::Guest.as_str()])
            .inc();
        Ok(user)
    }

    /// Portal sign-in is limited to admins and workstream managers.
    pub async fn portal_login(
        pool: &PgPool,
        config: &Config,
        email: &str,
        password: &str,
        client: ClientInfo,
    ) -> AppResult<LoginResponse> {
        let user = Self::authenticate(pool, email, password).await?;
        if !portal_role_allowed(user.role()) {
            metrics::LOGINS_COUNTER
                .with_label_values(&[user.role.as_str(), "forbidden"])
                .inc();
            return Err(AppError::PermissionDenied(
                "Only administrators and workstream managers can sign in to the portal.".into(),
            ));
        }
        Self::complete_login(pool, config, user, client).await
    }

    /// Registration through a workstream's site creates a student of that workstream.
    pub async fn workstream_register(
        pool: &PgPool,
        config: &Config,
        workstream: &CurrentWorkStream,
        req: &RegisterRequest,
        client: ClientInfo,
    ) -> AppResult<LoginResponse> {
        let email = Self::validate_registration(pool, req).await?;
        let password_hash = Self::hash_password(&req.password)?;

        let mut tx = pool.begin().await?;
        ensure_workstream_capacity(&mut tx, workstream.id, None).await?;
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, full_name, password_hash, role, work_stream_id)
             VALUES ($1, $2, $3, 'student', $4)
             RETURNING *",
        )
        .bind(&email)
        .bind(req.full_name.trim())
        .bind(&password_hash)
        .bind(workstream.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        metrics::USERS_CREATED_COUNTER
            .with_label_values(&[UserRole::Student.as_str()])
            .inc();
        tracing::info!("student {} registered in workstream {}", user.id, workstream.slug);
        Self::complete_login(pool, config, user, client).await
    }

    /// Sign-in through a workstream's site: the user must belong to it directly,
    /// through one of its schools, or be an admin.
    pub async fn workstream_login(
        pool: &PgPool,
        config: &Config,
        workstream: &CurrentWorkStream,
        email: &str,
        password: &str,
        client: ClientInfo,
    ) -> AppResult<LoginResponse> {
        let user = Self::authenticate(pool, email, password).await?;

        let school_ws: Option<Uuid> = match user.school_id {
            Some(school_id) => {
                sqlx::query_scalar("SELECT work_stream_id FROM schools WHERE id = $1")
                    .bind(school_id)
                    .fetch_optional(pool)
                    .await?
            }
            None => None,
        };
        let belongs = user.work_stream_id == Some(workstream.id) || school_ws == Some(workstream.id);

        if user.role() != UserRole::Admin && !belongs {
            metrics::LOGINS_COUNTER
                .with_label_values(&[user.role.as_str(), "forbidden"])
                .inc();
            return Err(AppError::PermissionDenied(
                "This account does not belong to this workstream.".into(),
            ));
        }
        Self::complete_login(pool, config, user, client).await
    }

    async fn validate_registration(pool: &PgPool, req: &RegisterRequest) -> AppResult<String> {
        let email = normalize_email(&req.email);
        let mut v = crate::errors::Validator::new();
        v.require(&email, "email")
            .check(email.contains('@'), "email", "Enter a valid email address.")
            .require(&req.full_name, "full_name")
            .check(
                req.password.chars().count() >= MIN_PASSWORD_LENGTH,
                "password",
                "Password must be at least 8 characters long.",
            );
        v.finish()?;

        let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(email) = $1)")
            .bind(&email)
            .fetch_one(pool)
            .await?;
        if taken {
            return Err(AppError::field("email", "A user with this email already exists."));
        }
        Ok(email)
    }

    /// Exchanges a stored, unrevoked refresh token for a new access token.
    pub async fn refresh(pool: &PgPool, config: &Config, refresh_token: &str) -> AppResult<AccessTokenResponse> {
        let claims = Self::decode_refresh_token(refresh_token, &config.jwt_refresh_secret)?;
        let jti: Uuid = claims
            .jti
            .parse()
            .map_err(|_| AppError::Unauthorized("Token is invalid or expired.".into()))?;

        let stored: RefreshToken =
            sqlx::query_as("SELECT * FROM refresh_tokens WHERE id = $1 AND revoked = FALSE")
                .bind(jti)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| AppError::Unauthorized("Token is blacklisted.".into()))?;

        if stored.expires_at < Utc::now() {
            return Err(AppError::Unauthorized("Token is invalid or expired.".into()));
        }
        if !bcrypt::verify(token_digest(refresh_token), &stored.token_hash).unwrap_or(false) {
            return Err(AppError::Unauthorized("Token is invalid or expired.".into()));
        }

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND is_active")
            .bind(stored.user_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::Unauthorized("This account is inactive.".into()))?;

        let access_token = Self::generate_access_token(
            user.id,
            user.role(),
            &config.jwt_secret,
            config.jwt_expiry_seconds,
        )?;
        Ok(AccessTokenResponse { access_token })
    }

    /// Blacklists a refresh token. Returns the owner's id.
    pub async fn logout(pool: &PgPool, config: &Config, refresh_token: &str) -> AppResult<Uuid> {
        let claims = Self::decode_refresh_token(refresh_token, &config.jwt_refresh_secret)
            .map_err(|_| AppError::BadRequest("Token is invalid or expired.".into()))?;
        let jti: Uuid = claims
            .jti
            .parse()
            .map_err(|_| AppError::BadRequest("Token is invalid or expired.".into()))?;

        let owner: Option<Uuid> = sqlx::query_scalar(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1 RETURNING user_id",
        )
        .bind(jti)
        .fetch_optional(pool)
        .await?;
        owner.ok_or_else(|| AppError::BadRequest("Token is invalid or expired.".into()))
    }

    /// Creates a single-use reset token when the email belongs to an active user.
    /// The caller answers identically either way; the raw token is returned only
    /// so debug builds can echo it.
    pub async fn request_password_reset(
        pool: &PgPool,
        email_svc: Option<&EmailService>,
        config: &Config,
        email: &str,
    ) -> AppResult<Option<String>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = $1 AND is_active")
            .bind(normalize_email(email))
            .fetch_optional(pool)
            .await?;
        let Some(user) = user else {
            return Ok(None);
        };

        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        let expires_at = Utc::now() + chrono::Duration::minutes(config.password_reset_ttl_minutes);

        sqlx::query(
            "INSERT INTO password_reset_tokens (user_id, token_hash, expires_at)
             VALUES ($1, $2, $3)",
        )
        .bind(user.id)
        .bind(token_digest(&token))
        .bind(expires_at)
        .execute(pool)
        .await?;

        metrics::PASSWORD_RESETS_COUNTER.inc();
        if let Some(svc) = email_svc {
            let reset_url = build_reset_url(&config.app_base_url, &token);
            if let Err(e) = svc.send_password_reset(&user.email, &user.full_name, &reset_url).await {
                tracing::warn!("password reset email to {} failed: {e:#}", user.email);
            }
        }
        Ok(Some(token))
    }

    /// Verify token, hash new password, mark token used, revoke all refresh tokens.
    pub async fn reset_password(pool: &PgPool, token: &str, new_password: &str) -> AppResult<()> {
        validate_password(new_password, "new_password")?;

        let mut tx = pool.begin().await?;
        let row: Option<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT id, user_id FROM password_reset_tokens
             WHERE token_hash = $1 AND used = FALSE AND expires_at > NOW()
             FOR UPDATE",
        )
        .bind(token_digest(token))
        .fetch_optional(&mut *tx)
        .await?;
        let (token_id, user_id) =
            row.ok_or_else(|| AppError::field("token", "The reset link is invalid or has expired."))?;

        let password_hash = Self::hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(&password_hash)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE password_reset_tokens SET used = TRUE WHERE id = $1")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("password reset completed for user {user_id}");
        Ok(())
    }

    pub async fn change_password(
        pool: &PgPool,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> AppResult<()> {
        let password_hash: String = sqlx::query_scalar("SELECT password_hash FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

        if !bcrypt::verify(current_password, &password_hash).unwrap_or(false) {
            return Err(AppError::field("current_password", "Current password is incorrect."));
        }
        validate_password(new_password, "new_password")?;

        let new_hash = Self::hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(&new_hash)
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn me(pool: &PgPool, user_id: Uuid) -> AppResult<User> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::decode_access_token;

    #[test]
    fn access_token_round_trip() {
        let id = Uuid::new_v4();
        let token = AuthService::generate_access_token(id, UserRole::ManagerSchool, "s3cret", 60).unwrap();
        let user = decode_access_token(&token, "s3cret").unwrap();
        assert_eq!(user.user_id, id);
        assert_eq!(user.role, UserRole::ManagerSchool);
        assert!(decode_access_token(&token, "other").is_err());
    }

    #[test]
    fn refresh_token_carries_row_id() {
        let id = Uuid::new_v4();
        let (token, jti) = AuthService::generate_refresh_token(id, "refresh", 7).unwrap();
        let claims = AuthService::decode_refresh_token(&token, "refresh").unwrap();
        assert_eq!(claims.jti, jti.to_string());
        assert_eq!(claims.sub, id.to_string());
        assert!(AuthService::decode_refresh_token(&token, "wrong").is_err());
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = token_digest("abc");
        assert_eq!(d.len(), 64);
        assert_eq!(d, token_digest("abc"));
        assert_ne!(d, token_digest("abd"));
    }

    #[test]
    fn only_admins_and_workstream_managers_use_the_portal() {
        assert!(portal_role_allowed(UserRole::Admin));
        assert!(portal_role_allowed(UserRole::ManagerWorkstream));
        for role in [UserRole::ManagerSchool, UserRole::Teacher, UserRole::Student, UserRole::Guest] {
            assert!(!portal_role_allowed(role));
        }
    }

    #[test]
    fn reset_url_has_single_slash() {
        assert_eq!(
            build_reset_url("https://edutrack.example/", "tok"),
            "https://edutrack.example/reset-password?token=tok"
        );
    }
}
