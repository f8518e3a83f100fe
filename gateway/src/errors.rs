//! Maps [`gateway_core::GatewayError`] onto the OpenAI-shaped HTTP error
//! envelope `{"error": {"message", "type", ...}}`.
//!
//! Kept in the binary crate rather than `gateway-core` so the library has
//! no `axum` dependency of its own.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::GatewayError;
use serde_json::json;

/// Newtype so we can implement the foreign `IntoResponse` trait for the
/// foreign `GatewayError` type.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.error_type(),
            }
        });
        if let GatewayError::Upstream { status: upstream_status, .. } = &self.0 {
            body["error"]["upstreamStatus"] = json!(upstream_status);
        }
        (status, Json(body)).into_response()
    }
}

/// The OpenAI-shaped 404 envelope for routes that don't exist, so every
/// response on the public surface is envelope-shaped rather than axum's
/// default plain-text 404.
pub async fn not_found() -> impl IntoResponse {
    let body = json!({
        "error": {
            "message": "The requested resource was not found",
            "type": "invalid_request_error",
        }
    });
    (StatusCode::NOT_FOUND, Json(body))
}
