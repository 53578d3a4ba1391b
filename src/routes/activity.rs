use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::Value;

use super::ok;
use crate::{
    errors::AppError,
    models::{activity::ActivityListQuery, auth::Actor},
    services::audit,
    AppState,
};

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(q): Query<ActivityListQuery>,
) -> Result<Json<Value>, AppError> {
    Ok(ok(audit::list(&state.db, &actor, &q).await?))
}
