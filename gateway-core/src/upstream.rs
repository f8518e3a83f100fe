//! Upstream Client (C8): the only module that speaks to the upstream
//! provider over the wire.
//!
//! Two flavours: [`UpstreamClient::post_buffered`]/
//! [`UpstreamClient::get_buffered`] parse the body and tag the outcome,
//! while [`UpstreamClient::post_streaming`] hands back the raw
//! [`reqwest::Response`] for passthrough. Credential auth differs by
//! surface: chat/embeddings/images use `Authorization: Bearer`, model
//! listing uses `x-goog-api-key`.

use crate::error::UpstreamError;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

/// A parsed response body, tagged by how the upstream's `Content-Type`
/// told us to read it.
#[derive(Debug, Clone)]
pub enum Body {
    /// Parsed as JSON.
    Json(Value),
    /// Everything else, kept as text.
    Text(String),
}

/// The result of a buffered (non-streaming) upstream call.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// HTTP status returned by the upstream.
    pub status: u16,
    /// Response headers, retained in case the caller needs to inspect
    /// rate-limit or retry-after hints.
    pub headers: HeaderMap,
    /// The parsed body.
    pub body: Body,
}

impl BufferedResponse {
    fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert to the `UpstreamError` the retry loop expects when the
    /// status line is not 2xx. Returns `None` on success.
    #[must_use]
    pub fn into_error(self) -> Option<UpstreamError> {
        if self.success() {
            return None;
        }
        let body = match self.body {
            Body::Json(value) => value.to_string(),
            Body::Text(text) => text,
        };
        Some(UpstreamError::Status { status: self.status, body })
    }
}

/// Thin HTTP client wrapper carrying the upstream base URL and the
/// configured per-request timeout.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    /// Build a client with the given per-request timeout applied to every
    /// call (including streaming calls, which only time out the initial
    /// connect-and-headers phase; body streaming itself is governed by the
    /// caller's cancellation token).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `reqwest` client cannot be built
    /// (invalid TLS configuration, etc).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// `POST` a JSON body, parse the response per its content type, and
    /// return a [`BufferedResponse`] regardless of status: the caller
    /// inspects `status`/`into_error` rather than getting an `Err` for
    /// non-2xx responses. `Err` is reserved for transport failure.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Transport`] if the request could not be
    /// sent at all (DNS, TLS, connect, or timeout).
    pub async fn post_buffered(
        &self,
        path: &str,
        auth: AuthHeader<'_>,
        json_body: &Value,
    ) -> Result<BufferedResponse, UpstreamError> {
        let request = self
            .http
            .post(self.url(path))
            .headers(auth.into_header_map())
            .json(json_body);
        let response = request.send().await.map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Self::buffer(response).await
    }

    /// `GET` with the given auth header, parse the response per its
    /// content type.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Transport`] if the request could not be
    /// sent at all.
    pub async fn get_buffered(&self, path: &str, auth: AuthHeader<'_>) -> Result<BufferedResponse, UpstreamError> {
        let response = self
            .http
            .get(self.url(path))
            .headers(auth.into_header_map())
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Self::buffer(response).await
    }

    async fn buffer(response: reqwest::Response) -> Result<BufferedResponse, UpstreamError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let is_json = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let text = response.text().await.map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let body = if is_json {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => Body::Json(value),
                Err(_) => Body::Text(text),
            }
        } else {
            Body::Text(text)
        };
        Ok(BufferedResponse { status, headers, body })
    }

    /// `POST` a JSON body and return the raw response for streaming
    /// passthrough. The caller is responsible for checking `status()`
    /// before piping the body.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Transport`] if the request could not be
    /// sent at all.
    pub async fn post_streaming(
        &self,
        path: &str,
        auth: AuthHeader<'_>,
        json_body: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.http
            .post(self.url(path))
            .headers(auth.into_header_map())
            .json(json_body)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }
}

/// Which header shape to send the credential under.
#[derive(Debug, Clone, Copy)]
pub enum AuthHeader<'a> {
    /// `Authorization: Bearer <credential>`, used for chat/embeddings/images.
    Bearer(&'a str),
    /// `x-goog-api-key: <credential>`, used for model listing.
    GoogleApiKey(&'a str),
}

impl AuthHeader<'_> {
    fn into_header_map(self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self {
            Self::Bearer(credential) => {
                let value = format!("Bearer {credential}");
                if let Ok(header) = HeaderValue::from_str(&value) {
                    headers.insert(reqwest::header::AUTHORIZATION, header);
                }
            }
            Self::GoogleApiKey(credential) => {
                if let Ok(header) = HeaderValue::from_str(credential) {
                    headers.insert("x-goog-api-key", header);
                }
            }
        }
        headers
    }
}

/// One upstream model translated into the OpenAI-shaped listing entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranslatedModel {
    /// Model id with any `models/` namespace prefix stripped.
    pub id: String,
    /// Always `"model"`, per the OpenAI shape.
    pub object: &'static str,
    /// Unix timestamp; the upstream rarely supplies one, so this defaults
    /// to zero rather than fabricating a creation date.
    pub created: i64,
    /// Owning organization string; defaults to the upstream's own name
    /// when the source payload doesn't carry one.
    pub owned_by: String,
}

const MODEL_NAMESPACE_PREFIX: &str = "models/";

/// Translate one upstream model listing entry.
///
/// Accepts either `{"name": "models/foo", ...}` (the upstream's own
/// field) or an already-bare `{"id": "foo", ...}`, falling back to
/// `owned_by: "upstream"` when the source has no owner field.
#[must_use]
pub fn translate_model(raw: &Value) -> Option<TranslatedModel> {
    let raw_id = raw
        .get("name")
        .or_else(|| raw.get("id"))
        .and_then(Value::as_str)?;
    let id = raw_id.strip_prefix(MODEL_NAMESPACE_PREFIX).unwrap_or(raw_id).to_string();
    let created = raw.get("created").and_then(Value::as_i64).unwrap_or(0);
    let owned_by = raw
        .get("owned_by")
        .or_else(|| raw.get("ownedBy"))
        .and_then(Value::as_str)
        .unwrap_or("upstream")
        .to_string();
    Some(TranslatedModel {
        id,
        object: "model",
        created,
        owned_by,
    })
}

/// Translate a full upstream model-listing payload. Accepts either a bare
/// JSON array or an object carrying the array under `models` or `data`.
#[must_use]
pub fn translate_model_list(raw: &Value) -> Vec<TranslatedModel> {
    let entries = raw
        .as_array()
        .cloned()
        .or_else(|| raw.get("models").and_then(Value::as_array).cloned())
        .or_else(|| raw.get("data").and_then(Value::as_array).cloned())
        .unwrap_or_default();
    entries.iter().filter_map(translate_model).collect()
}

/// Advisory model metadata: context length, capability flags, pricing.
/// Never blocks or fails a request: callers that can't get an answer in
/// time just render the listing without it.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ModelMetadata {
    /// Maximum context window in tokens, if known.
    pub context_length: Option<u32>,
    /// Whether the model supports streaming responses.
    pub supports_streaming: bool,
    /// Whether the model supports tool/function calling.
    pub supports_tools: bool,
    /// Advisory price per 1k input tokens in USD, if known.
    pub input_price_per_1k: Option<f64>,
}

fn builtin_defaults(model_id: &str) -> ModelMetadata {
    if model_id.starts_with("gemini-1.5-pro") || model_id.starts_with("gemini-2") {
        ModelMetadata {
            context_length: Some(1_000_000),
            supports_streaming: true,
            supports_tools: true,
            input_price_per_1k: None,
        }
    } else if model_id.starts_with("gemini") {
        ModelMetadata {
            context_length: Some(32_000),
            supports_streaming: true,
            supports_tools: true,
            input_price_per_1k: None,
        }
    } else {
        ModelMetadata::default()
    }
}

struct CatalogEntry {
    metadata: ModelMetadata,
    fetched_at: std::time::Instant,
}

/// Best-effort TTL cache over an external model-metadata catalog.
///
/// Holds one entry per model id for up to `ttl`. A cache miss or an
/// expired entry triggers `fetch`; if `fetch` fails, [`builtin_defaults`]
/// is used instead and nothing is cached (so the next call retries the
/// external source rather than pinning a failure result).
#[derive(Debug)]
pub struct ModelCatalog {
    ttl: Duration,
    entries: parking_lot::RwLock<std::collections::HashMap<String, CatalogEntry>>,
}

impl ModelCatalog {
    /// A catalog with the given TTL (typically around one hour).
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Resolve metadata for `model_id`, consulting the cache first, then
    /// `fetch`, then falling back to built-in defaults. `fetch` is an
    /// async closure so callers can plug in whatever external catalog
    /// client they have; this type has no opinion on the transport.
    pub async fn resolve<F, Fut>(&self, model_id: &str, fetch: F) -> ModelMetadata
    where
        F: FnOnce(&str) -> Fut,
        Fut: std::future::Future<Output = Option<ModelMetadata>>,
    {
        if let Some(entry) = self.entries.read().get(model_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.metadata.clone();
            }
        }
        match fetch(model_id).await {
            Some(metadata) => {
                self.entries.write().insert(
                    model_id.to_string(),
                    CatalogEntry {
                        metadata: metadata.clone(),
                        fetched_at: std::time::Instant::now(),
                    },
                );
                metadata
            }
            None => {
                tracing::debug!(model_id, "external model catalog unreachable, using built-in defaults");
                builtin_defaults(model_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_model_strips_namespace_prefix() {
        let raw = serde_json::json!({ "name": "models/gemini-pro", "owned_by": "google" });
        let translated = translate_model(&raw).unwrap();
        assert_eq!(translated.id, "gemini-pro");
        assert_eq!(translated.object, "model");
        assert_eq!(translated.owned_by, "google");
    }

    #[test]
    fn translate_model_defaults_owner_when_absent() {
        let raw = serde_json::json!({ "name": "models/foo" });
        let translated = translate_model(&raw).unwrap();
        assert_eq!(translated.owned_by, "upstream");
        assert_eq!(translated.created, 0);
    }

    #[test]
    fn translate_model_returns_none_without_id_field() {
        let raw = serde_json::json!({ "owned_by": "google" });
        assert!(translate_model(&raw).is_none());
    }

    #[test]
    fn translate_model_list_unwraps_models_envelope() {
        let raw = serde_json::json!({
            "models": [
                { "name": "models/a" },
                { "name": "models/b" },
            ]
        });
        let translated = translate_model_list(&raw);
        assert_eq!(translated.len(), 2);
        assert_eq!(translated[0].id, "a");
        assert_eq!(translated[1].id, "b");
    }

    #[test]
    fn translate_model_list_handles_bare_array() {
        let raw = serde_json::json!([{ "id": "already-bare" }]);
        let translated = translate_model_list(&raw);
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0].id, "already-bare");
    }

    #[test]
    fn buffered_response_into_error_is_none_on_success() {
        let response = BufferedResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Body::Json(serde_json::json!({"ok": true})),
        };
        assert!(response.into_error().is_none());
    }

    #[test]
    fn buffered_response_into_error_carries_status_and_body_on_failure() {
        let response = BufferedResponse {
            status: 429,
            headers: HeaderMap::new(),
            body: Body::Text("rate limited".to_string()),
        };
        let err = response.into_error().unwrap();
        assert_eq!(err.status(), Some(429));
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn catalog_falls_back_to_builtin_defaults_on_fetch_failure() {
        let catalog = ModelCatalog::new(Duration::from_secs(3600));
        let metadata = catalog
            .resolve("gemini-1.5-pro", |_| async { None })
            .await;
        assert_eq!(metadata.context_length, Some(1_000_000));
        assert!(metadata.supports_tools);
    }

    #[tokio::test]
    async fn catalog_caches_successful_fetch_within_ttl() {
        let catalog = ModelCatalog::new(Duration::from_secs(3600));
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let fetch_once = |_: &str| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {
                Some(ModelMetadata {
                    context_length: Some(4096),
                    supports_streaming: true,
                    supports_tools: false,
                    input_price_per_1k: Some(0.01),
                })
            }
        };

        let first = catalog.resolve("custom-model", fetch_once).await;
        let second = catalog.resolve("custom-model", fetch_once).await;
        assert_eq!(first.context_length, Some(4096));
        assert_eq!(second.context_length, Some(4096));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1, "second call must hit the cache");
    }
}
