//! Ambient per-request observability: a `uuid` v4 request id correlated
//! through the tracing span and response header, plus hand-rolled request
//! counters/duration/active-gauge metrics in the same style as
//! `gateway_core::metrics::render_prometheus`.

use crate::state::AppState;
use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach a fresh request id to the tracing span and, for non-streaming
/// responses, to the `x-request-id` response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!("request", request_id = %request_id, method = %request.method(), path = %request.uri().path());
    let _entered = span.enter();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Extension type carrying the per-request id into handlers that want it.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Increment the active-requests gauge around every handler and record its
/// terminal status/outcome, labeled by the route's matched path and method.
pub async fn request_metrics_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request.extensions().get::<MatchedPath>().map_or("unmatched", MatchedPath::as_str).to_string();
    let method = request.method().as_str().to_string();

    let guard = state.request_metrics.start(endpoint, method);
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let result = if status < 400 { "success" } else if status < 500 { "client_error" } else { "server_error" };
    guard.finish(status, result);
    response
}

#[derive(Default, Debug)]
struct Counters {
    /// Keyed by `"{endpoint} {method} {status} {result}"`.
    requests_total: HashMap<String, u64>,
    /// Keyed by endpoint; (sum of seconds, count) for a crude average.
    duration_seconds: HashMap<String, (f64, u64)>,
}

/// Process-wide request metrics: counters, a duration accumulator, and an
/// active-requests gauge, rendered alongside the credential gauges on
/// `GET /admin/metrics`.
#[derive(Default, Debug)]
pub struct RequestMetrics {
    counters: Mutex<Counters>,
    active_requests: AtomicI64,
}

/// RAII guard returned by [`RequestMetrics::start`]: increments the active
/// gauge on creation, decrements on drop, and records outcome on
/// [`Self::finish`].
#[derive(Debug)]
pub struct InFlight<'a> {
    metrics: &'a RequestMetrics,
    endpoint: String,
    method: String,
    started_at: Instant,
}

impl RequestMetrics {
    /// Begin tracking one request against `endpoint`/`method`.
    #[must_use]
    pub fn start(&self, endpoint: impl Into<String>, method: impl Into<String>) -> InFlight<'_> {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        InFlight {
            metrics: self,
            endpoint: endpoint.into(),
            method: method.into(),
            started_at: Instant::now(),
        }
    }

    /// Render Prometheus text exposition for the ambient request metrics.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let counters = self.counters.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out = String::new();
        out.push_str("# HELP gateway_requests_total Total requests by endpoint, method, status, and result.\n");
        out.push_str("# TYPE gateway_requests_total counter\n");
        let mut keys: Vec<&String> = counters.requests_total.keys().collect();
        keys.sort();
        for key in keys {
            let count = counters.requests_total[key];
            let mut parts = key.splitn(4, ' ');
            let (endpoint, method, status, result) = (
                parts.next().unwrap_or("unknown"),
                parts.next().unwrap_or("unknown"),
                parts.next().unwrap_or("unknown"),
                parts.next().unwrap_or("unknown"),
            );
            out.push_str(&format!(
                "gateway_requests_total{{endpoint=\"{endpoint}\",method=\"{method}\",status=\"{status}\",result=\"{result}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP gateway_request_duration_seconds_avg Average observed request duration by endpoint.\n");
        out.push_str("# TYPE gateway_request_duration_seconds_avg gauge\n");
        let mut duration_keys: Vec<&String> = counters.duration_seconds.keys().collect();
        duration_keys.sort();
        for key in duration_keys {
            let (sum, count) = counters.duration_seconds[key];
            let avg = if count == 0 { 0.0 } else { sum / count as f64 };
            out.push_str(&format!("gateway_request_duration_seconds_avg{{endpoint=\"{key}\"}} {avg}\n"));
        }

        out.push_str("# HELP gateway_active_requests Requests currently in flight.\n");
        out.push_str("# TYPE gateway_active_requests gauge\n");
        out.push_str(&format!("gateway_active_requests {}\n", self.active_requests.load(Ordering::Relaxed)));
        out
    }
}

impl InFlight<'_> {
    /// Record the terminal status/result and release the active gauge.
    /// `result` is a short label such as `"success"`, `"error"`, or
    /// `"client_error"`.
    pub fn finish(self, status: u16, result: &str) {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let mut counters = self.metrics.counters.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = format!("{} {} {status} {result}", self.endpoint, self.method);
        *counters.requests_total.entry(key).or_insert(0) += 1;
        let entry = counters.duration_seconds.entry(self.endpoint.to_string()).or_insert((0.0, 0));
        entry.0 += elapsed;
        entry.1 += 1;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
