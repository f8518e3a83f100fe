//! Admin Pipeline (C10): authenticated health summary, per-credential
//! listing, enable/disable, metrics scrape, and config reload.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use gateway_core::{GatewayError, PoolHealth};
use serde::Serialize;
use serde_json::json;

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let config = state.config.current();
    if crate::auth::admin_authorized(headers, config.policy.proxy.admin_token.as_deref()) {
        Ok(())
    } else {
        Err(GatewayError::Authentication.into())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    total: usize,
    healthy: usize,
    unhealthy: usize,
    disabled: usize,
}

/// `GET /healthz`: unauthenticated liveness probe. `200 ok` iff any
/// credential has derived status `active`; `503 degraded` otherwise.
pub async fn healthz(State(state): State<AppState>) -> Response {
    if state.keys.active_key_count() > 0 {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded").into_response()
    }
}

/// `GET /admin/health`.
///
/// # Errors
///
/// Returns an authentication-error envelope if the admin token is missing
/// or does not match.
pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let (pool_health, counts) = state.keys.health_summary();
    let status = match pool_health {
        PoolHealth::Healthy => "healthy",
        PoolHealth::Degraded => "degraded",
        PoolHealth::Unhealthy => "unhealthy",
    };
    Ok(Json(HealthResponse {
        status,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        total: counts.total,
        healthy: counts.healthy,
        unhealthy: counts.unhealthy,
        disabled: counts.disabled,
    })
    .into_response())
}

#[derive(Serialize)]
struct KeySummaryResponse {
    id: String,
    status: &'static str,
    score: f64,
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    failure_count: u32,
    next_attempt: Option<chrono::DateTime<chrono::Utc>>,
    weight: u32,
}

/// `GET /admin/keys`.
///
/// # Errors
///
/// Returns an authentication-error envelope if the admin token is missing
/// or does not match.
pub async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let summaries: Vec<KeySummaryResponse> = state
        .keys
        .list_keys()
        .into_iter()
        .map(|k| KeySummaryResponse {
            id: k.id,
            status: k.status.as_str(),
            score: k.score,
            last_used_at: k.last_used_at,
            failure_count: k.failure_count,
            next_attempt: k.next_attempt,
            weight: k.weight,
        })
        .collect();
    Ok(Json(summaries).into_response())
}

/// `POST /admin/keys/{id}/enable`.
///
/// # Errors
///
/// Returns an authentication-error envelope if unauthorized, or an
/// `invalid_request_error` 404-mapped envelope if `id` is unknown.
pub async fn enable_key(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    if state.keys.enable_key(&id) {
        Ok(Json(json!({"id": id, "enabled": true})).into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(json!({"error": {"message": "unknown credential id", "type": "invalid_request_error"}}))).into_response())
    }
}

/// `POST /admin/keys/{id}/disable`.
///
/// # Errors
///
/// Returns an authentication-error envelope if unauthorized, or an
/// `invalid_request_error` 404-mapped envelope if `id` is unknown.
pub async fn disable_key(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    if state.keys.disable_key(&id) {
        Ok(Json(json!({"id": id, "enabled": false})).into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(json!({"error": {"message": "unknown credential id", "type": "invalid_request_error"}}))).into_response())
    }
}

/// `GET /admin/metrics`: Prometheus text exposition combining the ambient
/// request metrics with the credential-pool gauges.
///
/// # Errors
///
/// Returns an authentication-error envelope if the admin token is missing
/// or does not match.
pub async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let mut body = state.request_metrics.render_prometheus();
    body.push_str(&gateway_core::metrics::render_prometheus(&state.keys.credential_gauges()));
    Ok((StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

/// `POST /admin/config/reload`: force a synchronous re-read of both
/// configuration documents and reconcile the pool against the result.
///
/// # Errors
///
/// Returns an authentication-error envelope if unauthorized, or an
/// `internal_error` envelope if the documents could not be re-read.
pub async fn reload_config(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    state.config.force_reload().map_err(|err| GatewayError::Internal(err.to_string()))?;
    let config = state.config.current();
    let counts = state.keys.reconcile(&config.credentials.keys);
    state.keys.update_monitoring_config(&config.policy.monitoring);
    Ok(Json(json!({"added": counts.added, "removed": counts.removed, "updated": counts.updated})).into_response())
}
