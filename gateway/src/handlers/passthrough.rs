//! `POST /v1/embeddings` and `POST /v1/images/generations` (C9): single
//! attempt, forward the body verbatim, propagate the response as-is.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use gateway_core::upstream::Body as UpstreamBody;
use gateway_core::{AuthHeader, GatewayError};
use serde_json::Value;
use std::time::Instant;

async fn forward(state: &AppState, headers: &HeaderMap, path: &str, raw_body: &bytes::Bytes) -> Result<Response, ApiError> {
    let config = state.config.current();
    let proxy = &config.policy.proxy;
    if !crate::auth::client_authorized(headers, proxy.require_auth, &proxy.access_tokens) {
        return Err(GatewayError::Authentication.into());
    }
    if raw_body.len() > proxy.max_payload_size_bytes {
        return Err(GatewayError::PayloadTooLarge.into());
    }
    let parsed: Value =
        serde_json::from_slice(raw_body).map_err(|err| GatewayError::InvalidRequest(format!("body is not valid JSON: {err}")))?;

    let Some(id) = state.keys.select_key() else {
        return Err(GatewayError::NoHealthyKeys.into());
    };
    let Some(secret) = state.keys.credential_secret(&id) else {
        return Err(GatewayError::NoHealthyKeys.into());
    };

    let started = Instant::now();
    match state.upstream.post_buffered(path, AuthHeader::Bearer(&secret), &parsed).await {
        Ok(response) => {
            let status = response.status;
            let body = response.body.clone();
            if let Some(err) = response.into_error() {
                state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
                return Err(GatewayError::Upstream { status, body: err.to_string() }.into());
            }
            state.keys.record_success(&id, started.elapsed().as_millis() as u64);
            let rendered = match body {
                UpstreamBody::Json(value) => value.to_string(),
                UpstreamBody::Text(text) => text,
            };
            Ok(Response::builder()
                .status(status)
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(rendered))
                .unwrap_or_else(|_| Response::new(Body::empty())))
        }
        Err(err) => {
            state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
            Err(GatewayError::Upstream { status: err.status().unwrap_or(502), body: err.to_string() }.into())
        }
    }
}

/// `POST /v1/embeddings`.
///
/// # Errors
///
/// Returns an error envelope for client-side validation, exhaustion, or
/// upstream failure.
pub async fn embeddings(State(state): State<AppState>, headers: HeaderMap, body: bytes::Bytes) -> Result<Response, ApiError> {
    forward(&state, &headers, "/embeddings", &body).await
}

/// `POST /v1/images/generations`.
///
/// # Errors
///
/// Returns an error envelope for client-side validation, exhaustion, or
/// upstream failure.
pub async fn image_generations(State(state): State<AppState>, headers: HeaderMap, body: bytes::Bytes) -> Result<Response, ApiError> {
    forward(&state, &headers, "/images/generations", &body).await
}
