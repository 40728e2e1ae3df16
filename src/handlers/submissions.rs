use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    error::ApiError, extractors::ValidJson, state::AppState, submissions::create_submission,
    types::SubmitResponse,
};

pub async fn submit_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ValidJson(fields): ValidJson<Map<String, Value>>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let key = format!("submit:{client}");
    if !state.rate_limiter.allow(
        &key,
        state.limits.submit_rate_limit,
        state.limits.submit_rate_window,
    ) {
        return Err(ApiError::RateLimited(
            "too many submissions, try again later".to_string(),
        ));
    }

    let slug = slug.trim();
    if slug.is_empty() {
        return Err(ApiError::BadRequest("form slug is required".to_string()));
    }
    if fields.is_empty() {
        return Err(ApiError::BadRequest(
            "submission must contain at least one field".to_string(),
        ));
    }

    let _permit = state
        .limiter
        .acquire_write(state.limits.acquire_timeout)
        .await?;

    let created = create_submission(
        &state.pool,
        &state.busy_retry,
        slug,
        &Value::Object(fields),
        Utc::now(),
    )
    .await?;

    info!(
        form = slug,
        submission_id = %created.submission_id,
        webhook = created.webhook_event_id.is_some(),
        email = created.email_event_id.is_some(),
        "submission stored"
    );

    Ok((StatusCode::CREATED, Json(created)))
}
