//! Error taxonomy for the gateway core: structured enums carrying enough
//! context to log before being turned into a response, rather than a
//! single opaque string.

use thiserror::Error;

/// Errors raised while talking to the upstream provider.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream returned a non-2xx HTTP status.
    #[error("upstream returned status {status}")]
    Status {
        /// HTTP status code returned by the upstream.
        status: u16,
        /// Raw response body, retained for propagation to the caller.
        body: String,
    },
    /// The request could not even reach the upstream (DNS, TLS, connect, timeout).
    #[error("upstream request failed: {0}")]
    Transport(String),
    /// The upstream responded but the body could not be parsed as JSON.
    #[error("upstream response was not valid JSON: {0}")]
    InvalidBody(String),
}

impl UpstreamError {
    /// Returns the HTTP status code, if this is a [`UpstreamError::Status`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) | Self::InvalidBody(_) => None,
        }
    }

    /// Whether this failure justifies rotating to another credential:
    /// any 5xx, or a 429 (rate limit), or a transport-level failure.
    #[must_use]
    pub fn is_rotation_worthy(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Transport(_) => true,
            Self::InvalidBody(_) => false,
        }
    }

    /// Whether this failure should flip the circuit breaker's rate-limit fast path.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == 429)
    }
}

/// Errors surfaced at the edge of the public HTTP surface.
///
/// Each variant maps to exactly one HTTP status code and `error.type` string
/// in the OpenAI-shaped error envelope (see `gateway::errors`).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request body, wrong content type, or missing required fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Missing or invalid bearer token on a route that requires one.
    #[error("authentication failed")]
    Authentication,
    /// Request body exceeded the configured size limit.
    #[error("payload too large")]
    PayloadTooLarge,
    /// `Content-Type` was not an accepted media type.
    #[error("unsupported media type")]
    UnsupportedMediaType,
    /// No eligible credential was available at selection time.
    #[error("No healthy API keys available")]
    NoHealthyKeys,
    /// All attempted credentials failed against the upstream; carries the
    /// last observed upstream status and body for propagation.
    #[error("upstream error (status {status})")]
    Upstream {
        /// Last upstream HTTP status observed across the retry loop.
        status: u16,
        /// Last upstream response body observed across the retry loop.
        body: String,
    },
    /// Unexpected internal failure (persistence I/O, bug, panic boundary).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The `error.type` string placed in the OpenAI-shaped envelope.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::NoHealthyKeys => "service_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The HTTP status code this error maps to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Authentication => 401,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::NoHealthyKeys => 503,
            Self::Upstream { status, .. } => *status,
            Self::Internal(_) => 500,
        }
    }
}
