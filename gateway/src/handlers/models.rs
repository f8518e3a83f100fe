//! `GET /v1/models` and `GET /v1/models/{id}` (C9): single-attempt model
//! listing, translated to the OpenAI shape via [`gateway_core::upstream`].

use crate::errors::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use gateway_core::{translate_model, translate_model_list, AuthHeader, GatewayError};
use serde_json::json;

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let config = state.config.current();
    let proxy = &config.policy.proxy;
    if crate::auth::client_authorized(headers, proxy.require_auth, &proxy.access_tokens) {
        Ok(())
    } else {
        Err(GatewayError::Authentication.into())
    }
}

async fn single_attempt_get(state: &AppState, path: &str) -> Result<gateway_core::BufferedResponse, ApiError> {
    let Some(id) = state.keys.select_key() else {
        return Err(GatewayError::NoHealthyKeys.into());
    };
    let Some(secret) = state.keys.credential_secret(&id) else {
        return Err(GatewayError::NoHealthyKeys.into());
    };
    let started = std::time::Instant::now();
    match state.upstream.get_buffered(path, AuthHeader::GoogleApiKey(&secret)).await {
        Ok(response) => {
            if (200..300).contains(&response.status) {
                state.keys.record_success(&id, started.elapsed().as_millis() as u64);
            } else {
                state.keys.record_failure(&id, response.status == 429, started.elapsed().as_millis() as u64);
            }
            Ok(response)
        }
        Err(err) => {
            state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
            Err(GatewayError::Upstream { status: err.status().unwrap_or(502), body: err.to_string() }.into())
        }
    }
}

/// `GET /v1/models`.
///
/// # Errors
///
/// Returns an error envelope if no credential is available or the upstream
/// call fails outright.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let response = single_attempt_get(&state, "/models").await?;
    let raw = match &response.body {
        gateway_core::upstream::Body::Json(value) => value.clone(),
        gateway_core::upstream::Body::Text(_) => serde_json::Value::Null,
    };
    let models = translate_model_list(&raw);
    let status = axum::http::StatusCode::from_u16(response.status).unwrap_or(axum::http::StatusCode::OK);
    Ok((status, Json(json!({ "object": "list", "data": models }))).into_response())
}

/// `GET /v1/models/{id}`.
///
/// # Errors
///
/// Returns an error envelope if no credential is available, the upstream
/// call fails, or the requested model is not present upstream.
pub async fn get_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model_id): Path<String>,
) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let response = single_attempt_get(&state, &format!("/models/{model_id}")).await?;
    let raw = match &response.body {
        gateway_core::upstream::Body::Json(value) => value.clone(),
        gateway_core::upstream::Body::Text(_) => serde_json::Value::Null,
    };
    let Some(model) = translate_model(&raw) else {
        return Err(GatewayError::InvalidRequest(format!("model {model_id} not found upstream")).into());
    };
    let status = axum::http::StatusCode::from_u16(response.status).unwrap_or(axum::http::StatusCode::OK);
    Ok((status, Json(model)).into_response())
}
