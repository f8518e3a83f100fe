//! Shared process state handed to every handler via `axum::extract::State`.

use crate::telemetry::RequestMetrics;
use gateway_core::{ConfigWatcher, KeyManager, UpstreamClient};
use std::sync::Arc;
use std::time::Instant;

/// Everything a handler needs: the credential pool, the upstream client,
/// the live config view, and process start time for uptime reporting.
#[derive(Clone, Debug)]
pub struct AppState {
    /// The credential pool (C7).
    pub keys: Arc<KeyManager>,
    /// The upstream HTTP client (C8).
    pub upstream: Arc<UpstreamClient>,
    /// Hot-reloadable policy/credential configuration (C1).
    pub config: Arc<ConfigWatcher>,
    /// Process start time, for `GET /admin/health` uptime reporting.
    pub started_at: Instant,
    /// Ambient per-endpoint request counters/duration/active gauge.
    pub request_metrics: Arc<RequestMetrics>,
}
