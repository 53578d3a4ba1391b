use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::{
    errors::AppError,
    middleware::{
        rate_limit::{email_key, AUTH_LIMIT},
        workstream::CurrentWorkStream,
    },
    models::{
        activity::ActionType,
        auth::{
            Actor, ChangePasswordRequest, ClientInfo, ForgotPasswordRequest, LoginRequest, RefreshTokenRequest,
            RegisterRequest, ResetPasswordRequest,
        },
    },
    services::{
        audit::{self, AuditEntry},
        auth::AuthService,
    },
    AppState,
};

const RESET_MESSAGE: &str = "If an account exists for this email, a reset link has been sent.";

async fn throttle(state: &AppState, action: &str, email: &str) -> Result<(), AppError> {
    let mut redis = state.redis.clone();
    AUTH_LIMIT.hit(&mut redis, &email_key(action, email)).await
}

pub async fn portal_register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let user = AuthService::portal_register(&state.db, &body).await?;
    tracing::info!("guest account {} registered", user.id);
    Ok((StatusCode::CREATED, Json(json!(user))))
}

pub async fn portal_login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, AppError> {
    throttle(&state, "login", &body.email).await?;
    let response = AuthService::portal_login(&state.db, &state.config, &body.email, &body.password, client).await?;
    Ok(Json(json!(response)))
}

pub async fn workstream_register(
    State(state): State<AppState>,
    workstream: CurrentWorkStream,
    client: ClientInfo,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let response = AuthService::workstream_register(&state.db, &state.config, &workstream, &body, client).await?;
    super::welcome(&state, &response.user.email, &response.user.full_name, response.user.role());
    Ok((StatusCode::CREATED, Json(json!(response))))
}

pub async fn workstream_login(
    State(state): State<AppState>,
    workstream: CurrentWorkStream,
    client: ClientInfo,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, AppError> {
    throttle(&state, "login", &body.email).await?;
    let response =
        AuthService::workstream_login(&state.db, &state.config, &workstream, &body.email, &body.password, client)
            .await?;
    Ok(Json(json!(response)))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshTokenRequest>,
) -> Result<Json<Value>, AppError> {
    let response = AuthService::refresh(&state.db, &state.config, &body.refresh_token).await?;
    Ok(Json(json!(response)))
}

pub async fn logout(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(body): Json<RefreshTokenRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = AuthService::logout(&state.db, &state.config, &body.refresh_token).await?;
    audit::log(
        state.db.clone(),
        AuditEntry {
            actor_id: Some(user_id),
            action: ActionType::Logout,
            entity_type: "user",
            entity_id: Some(user_id.to_string()),
            description: "User logged out".into(),
            ip_address: client.ip_address,
        },
    );
    Ok(Json(json!({ "message": "Logged out." })))
}

/// Answers the same way whether or not the email is known.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(body): Json<ForgotPasswordRequest>,
) -> Result<Json<Value>, AppError> {
    throttle(&state, "forgot", &body.email).await?;
    let token =
        AuthService::request_password_reset(&state.db, state.email.as_deref(), &state.config, &body.email).await?;

    match token {
        Some(token) if state.config.debug => Ok(Json(json!({ "message": RESET_MESSAGE, "token": token }))),
        _ => Ok(Json(json!({ "message": RESET_MESSAGE }))),
    }
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<Json<Value>, AppError> {
    AuthService::reset_password(&state.db, &body.token, &body.new_password).await?;
    Ok(Json(json!({ "message": "Your password has been reset." })))
}

pub async fn me(State(state): State<AppState>, actor: Actor) -> Result<Json<Value>, AppError> {
    let user = AuthService::me(&state.db, actor.id).await?;
    Ok(Json(json!(user)))
}

pub async fn change_password(
    State(state): State<AppState>,
    actor: Actor,
    client: ClientInfo,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    AuthService::change_password(&state.db, actor.id, &body.current_password, &body.new_password).await?;
    audit::log(
        state.db.clone(),
        AuditEntry::new(&actor, ActionType::Update, "user", actor.id)
            .describe(format!("{} changed their password", actor.email))
            .from_client(&client),
    );
    Ok(Json(json!({ "message": "Password changed." })))
}
