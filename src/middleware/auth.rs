use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};

use crate::{
    models::{
        auth::{Actor, AuthenticatedUser, Claims, ClientInfo},
        user::User,
    },
    AppState,
};

type Rejection = (StatusCode, Json<Value>);

fn reject(status: StatusCode, message: &str) -> Rejection {
    (status, Json(json!({ "error": message })))
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Invalid Authorization header format"))?;

        let secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or_else(|| reject(StatusCode::INTERNAL_SERVER_ERROR, "JWT secret not configured"))?;

        decode_access_token(token, &secret.0)
            .map_err(|_| reject(StatusCode::UNAUTHORIZED, "Invalid or expired token"))
    }
}

/// Resolves the bearer token to the stored, active user. Deactivated accounts
/// are rejected even while their access token is still valid.
impl FromRequestParts<AppState> for Actor {
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = AuthenticatedUser::from_request_parts(parts, state).await?;

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(auth.user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| {
                tracing::error!("actor lookup failed for {}: {e}", auth.user_id);
                reject(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            })?;

        match user {
            Some(u) if u.is_active => Ok(Actor::from(&u)),
            _ => Err(reject(StatusCode::UNAUTHORIZED, "Account is inactive or no longer exists")),
        }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientInfo::from_headers(&parts.headers))
    }
}

impl ClientInfo {
    pub fn from_headers(h: &HeaderMap) -> Self {
        let ip_address = h
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                h.get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.split(',').next())
                    .map(|s| s.trim())
            })
            .map(str::to_string);
        let user_agent = h
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self { ip_address, user_agent }
    }
}

/// Extension type to carry the JWT secret through request extensions.
#[derive(Clone)]
pub struct JwtSecret(pub String);

pub fn decode_access_token(token: &str, secret: &str) -> Result<AuthenticatedUser, anyhow::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<Claims>(token, &key, &validation)?;
    let claims = data.claims;

    Ok(AuthenticatedUser {
        user_id: claims.sub.parse()?,
        role: claims.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Extension, Router};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{models::user::UserRole, services::auth::AuthService};

    const SECRET: &str = "test-secret";

    async fn whoami(user: AuthenticatedUser) -> String {
        format!("{}:{}", user.user_id, user.role)
    }

    fn app() -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(Extension(JwtSecret(SECRET.into())))
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let res = app()
            .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_signed_with_other_secret_is_rejected() {
        let token = AuthService::generate_access_token(Uuid::new_v4(), UserRole::Admin, "other", 60).unwrap();
        let res = app()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_yields_user() {
        let id = Uuid::new_v4();
        let token = AuthService::generate_access_token(id, UserRole::Teacher, SECRET, 60).unwrap();
        let res = app()
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(std::str::from_utf8(&body).unwrap(), format!("{id}:teacher"));
    }

    #[test]
    fn client_info_prefers_real_ip() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(ClientInfo::from_headers(&h).ip_address.as_deref(), Some("10.0.0.1"));
        h.insert("x-real-ip", "192.168.1.5".parse().unwrap());
        assert_eq!(ClientInfo::from_headers(&h).ip_address.as_deref(), Some("192.168.1.5"));
    }
}
