//! `POST /v1/chat/completions` (C9): the retry/rotation loop, streaming and
//! buffered paths, reasoning-effort translation, and marker substitution.

use crate::errors::ApiError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use gateway_core::upstream::Body as UpstreamBody;
use gateway_core::{substitute_buffered, AuthHeader, GatewayError, MarkerFilter};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;

/// Namespaced so it never collides with an upstream field name.
const THINKING_BUDGET_FIELD: &str = "extra_thinking_budget_tokens";

fn translate_reasoning_effort(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let Some(effort) = obj.remove("reasoning_effort") else {
        return;
    };
    let budget = match effort.as_str() {
        Some("low") => 1024,
        Some("medium") => 8192,
        Some("high") => 24576,
        _ => -1,
    };
    obj.insert(THINKING_BUDGET_FIELD.to_string(), Value::from(budget));
}

fn validate_chat_body(body: &Value) -> Result<(), GatewayError> {
    let Some(obj) = body.as_object() else {
        return Err(GatewayError::InvalidRequest("request body must be a JSON object".to_string()));
    };
    if !obj.get("model").is_some_and(Value::is_string) {
        return Err(GatewayError::InvalidRequest("missing required field: model".to_string()));
    }
    if !obj.get("messages").is_some_and(Value::is_array) {
        return Err(GatewayError::InvalidRequest("missing required field: messages".to_string()));
    }
    Ok(())
}

fn is_streaming_request(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// `POST /v1/chat/completions`.
///
/// # Errors
///
/// Returns the OpenAI-shaped error envelope for client-side validation
/// failures, exhaustion of the attempt budget, and unexpected internal
/// failures.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<Response, ApiError> {
    let config = state.config.current();
    let proxy = &config.policy.proxy;

    if !crate::auth::client_authorized(&headers, proxy.require_auth, &proxy.access_tokens) {
        return Err(GatewayError::Authentication.into());
    }

    let content_type_ok = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !content_type_ok {
        return Err(GatewayError::UnsupportedMediaType.into());
    }
    if body.len() > proxy.max_payload_size_bytes {
        return Err(GatewayError::PayloadTooLarge.into());
    }

    let mut parsed: Value = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("body is not valid JSON: {err}")))?;
    validate_chat_body(&parsed)?;
    translate_reasoning_effort(&mut parsed);
    let streaming = is_streaming_request(&parsed);

    let attempt_budget = state.keys.attempt_budget();
    let mut attempted: HashSet<String> = HashSet::new();
    let mut last_failure: Option<(u16, String)> = None;

    for _ in 0..attempt_budget {
        let Some(id) = state.keys.select_key() else {
            break;
        };
        if attempted.contains(&id) {
            continue;
        }
        attempted.insert(id.clone());
        let Some(secret) = state.keys.credential_secret(&id) else {
            continue;
        };

        let started = Instant::now();
        if streaming {
            match state
                .upstream
                .post_streaming("/chat/completions", AuthHeader::Bearer(&secret), &parsed)
                .await
            {
                Ok(response) if response.status().is_success() => {
                    state.keys.record_success(&id, started.elapsed().as_millis() as u64);
                    return Ok(stream_response(response));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    state.keys.record_failure(&id, status == 429, started.elapsed().as_millis() as u64);
                    last_failure = Some((status, text));
                }
                Err(err) => {
                    state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
                    last_failure = Some((err.status().unwrap_or(502), err.to_string()));
                }
            }
        } else {
            match state.upstream.post_buffered("/chat/completions", AuthHeader::Bearer(&secret), &parsed).await {
                Ok(response) => {
                    let status = response.status;
                    let body = response.body.clone();
                    if let Some(err) = response.into_error() {
                        state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
                        last_failure = Some((status, err.to_string()));
                        continue;
                    }
                    state.keys.record_success(&id, started.elapsed().as_millis() as u64);
                    return Ok(buffered_success_response(status, body));
                }
                Err(err) => {
                    state.keys.record_failure(&id, err.is_rate_limit(), started.elapsed().as_millis() as u64);
                    last_failure = Some((err.status().unwrap_or(502), err.to_string()));
                }
            }
        }
    }

    match last_failure {
        Some((status, body)) => Err(GatewayError::Upstream { status, body }.into()),
        None => Err(GatewayError::NoHealthyKeys.into()),
    }
}

fn buffered_success_response(status: u16, body: UpstreamBody) -> Response {
    let substituted = match body {
        UpstreamBody::Json(value) => substitute_buffered(&value.to_string()),
        UpstreamBody::Text(text) => substitute_buffered(&text),
    };
    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(substituted))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Pipe an upstream SSE response to the client, applying marker
/// substitution chunk-by-chunk without buffering the whole stream.
/// `content-length`/`content-encoding` are dropped: substitution changes
/// body size and upstream compression cannot pass through unchanged.
fn stream_response(upstream: reqwest::Response) -> Response {
    let mut byte_stream = upstream.bytes_stream();
    let body_stream = async_stream::stream! {
        let mut filter = MarkerFilter::new();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let out = filter.push(&bytes);
                    if !out.is_empty() {
                        yield Ok::<_, std::io::Error>(bytes::Bytes::from(out));
                    }
                }
                Err(err) => {
                    yield Err(std::io::Error::other(err.to_string()));
                    return;
                }
            }
        }
        let tail = filter.finish();
        if !tail.is_empty() {
            yield Ok(bytes::Bytes::from(tail));
        }
    };

    Response::builder()
        .status(axum::http::StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_effort_maps_known_levels_to_fixed_budgets() {
        for (level, expected) in [("low", 1024), ("medium", 8192), ("high", 24576), ("bogus", -1)] {
            let mut body = serde_json::json!({"reasoning_effort": level});
            translate_reasoning_effort(&mut body);
            assert_eq!(body[THINKING_BUDGET_FIELD], expected);
            assert!(body.get("reasoning_effort").is_none());
        }
    }

    #[test]
    fn reasoning_effort_absent_leaves_body_untouched() {
        let mut body = serde_json::json!({"model": "m"});
        translate_reasoning_effort(&mut body);
        assert_eq!(body, serde_json::json!({"model": "m"}));
    }

    #[test]
    fn validate_chat_body_requires_model_and_messages() {
        assert!(validate_chat_body(&serde_json::json!({})).is_err());
        assert!(validate_chat_body(&serde_json::json!({"model": "m"})).is_err());
        assert!(validate_chat_body(&serde_json::json!({"model": "m", "messages": []})).is_ok());
    }

    #[test]
    fn streaming_flag_defaults_to_false() {
        assert!(!is_streaming_request(&serde_json::json!({})));
        assert!(is_streaming_request(&serde_json::json!({"stream": true})));
    }

    use crate::state::AppState;
    use crate::telemetry::RequestMetrics;
    use axum::body::to_bytes;
    use axum::extract::State;
    use gateway_core::{CredentialConfig, DocumentStore, KeyManager, MonitoringPolicy, ResilientStore, SqliteStore, UpstreamClient};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bootstrap_state(dir: &std::path::Path, upstream_base_url: &str, credentials: &[CredentialConfig]) -> AppState {
        let primary = SqliteStore::open(&dir.join("primary.sqlite3")).unwrap();
        let fallback = DocumentStore::new(dir.join("fallback.json"));
        let store = Arc::new(ResilientStore::new(primary, fallback));
        let keys = Arc::new(KeyManager::bootstrap(credentials, Vec::new(), &MonitoringPolicy::default(), store));
        let upstream = Arc::new(UpstreamClient::new(upstream_base_url, Duration::from_secs(5)).unwrap());
        let config = Arc::new(gateway_core::ConfigWatcher::new(dir.join("policy.json"), dir.join("keys.json")).unwrap());
        AppState {
            keys,
            upstream,
            config,
            started_at: Instant::now(),
            request_metrics: Arc::new(RequestMetrics::default()),
        }
    }

    fn one_credential(name: &str) -> CredentialConfig {
        CredentialConfig { name: name.to_string(), key: format!("secret-{name}"), weight: None, cooldown_seconds: Some(0) }
    }

    #[tokio::test]
    async fn happy_path_records_success_and_returns_upstream_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": [{"text": "hi"}]})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = bootstrap_state(dir.path(), &server.uri(), &[one_credential("k1")]);

        let body = bytes::Bytes::from(serde_json::to_vec(&serde_json::json!({"model": "m", "messages": []})).unwrap());
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());

        let response = chat_completions(State(state.clone()), headers, body).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["choices"][0]["text"], "hi");

        let summary = &state.keys.list_keys()[0];
        assert_eq!(summary.status.as_str(), "active");
    }

    #[tokio::test]
    async fn rate_limit_on_first_credential_rotates_to_second() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(wiremock::matchers::header("authorization", "Bearer secret-k1"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({"error": "rate limited"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(wiremock::matchers::header("authorization", "Bearer secret-k2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let state = bootstrap_state(dir.path(), &server.uri(), &[one_credential("k1"), one_credential("k2")]);

        let body = bytes::Bytes::from(serde_json::to_vec(&serde_json::json!({"model": "m", "messages": []})).unwrap());
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());

        let response = chat_completions(State(state.clone()), headers, body).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        // Selection order between two equal-weight candidates is random, so
        // assert on the shape of the outcome rather than which id landed
        // where: exactly one credential absorbed the 429 and tripped open,
        // the other served the eventual success.
        let summaries = state.keys.list_keys();
        let open_count = summaries.iter().filter(|s| s.status.as_str() == "circuit_open").count();
        let active_count = summaries.iter().filter(|s| s.status.as_str() == "active").count();
        assert_eq!(open_count, 1);
        assert_eq!(active_count, 1);
    }

    #[tokio::test]
    async fn no_eligible_credential_returns_503() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = bootstrap_state(dir.path(), &server.uri(), &[]);

        let body = bytes::Bytes::from(serde_json::to_vec(&serde_json::json!({"model": "m", "messages": []})).unwrap());
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());

        let err = chat_completions(State(state), headers, body).await.unwrap_err();
        assert_eq!(err.0.status_code(), 503);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_any_upstream_attempt() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = bootstrap_state(dir.path(), &server.uri(), &[one_credential("k1")]);

        let oversized = bytes::Bytes::from(vec![b'a'; 20 * 1024 * 1024]);
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());

        let err = chat_completions(State(state.clone()), headers, oversized).await.unwrap_err();
        assert_eq!(err.0.status_code(), 413);
        assert!(state.keys.list_keys()[0].last_used_at.is_none());
    }
}
