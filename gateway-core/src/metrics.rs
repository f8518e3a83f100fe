//! Request metric history and Prometheus text exposition.
//!
//! Hand-rolled exposition format: plain `format!` strings, no `prometheus`
//! crate, one line per gauge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of [`RequestMetric`] rows retained in memory and mirrored
/// to the store. Reporting only; nothing reads this for control flow.
pub const MAX_HISTORY: usize = 1000;

/// The single outcome a served upstream call can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The call succeeded.
    Success,
    /// The call failed (upstream error, transport error, or rejection).
    Error,
}

/// One append-only observation of a served upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    /// Which credential served (or failed to serve) the call.
    pub credential_id: String,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
    /// Success or error; a row records exactly one.
    pub outcome: Outcome,
    /// Wall-clock latency of the call, in milliseconds.
    pub latency_ms: u64,
}

/// Bounded, append-only in-memory log of [`RequestMetric`] rows.
#[derive(Debug, Default)]
pub struct MetricsLog {
    rows: VecDeque<RequestMetric>,
}

impl MetricsLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    /// Append a row, evicting the oldest once [`MAX_HISTORY`] is exceeded.
    pub fn record(&mut self, metric: RequestMetric) {
        if self.rows.len() >= MAX_HISTORY {
            self.rows.pop_front();
        }
        self.rows.push_back(metric);
    }

    /// All retained rows, oldest first.
    #[must_use]
    pub fn rows(&self) -> impl Iterator<Item = &RequestMetric> {
        self.rows.iter()
    }

    /// Rows for a single credential, oldest first.
    pub fn rows_for(&self, credential_id: &str) -> impl Iterator<Item = &RequestMetric> {
        self.rows.iter().filter(move |row| row.credential_id == credential_id)
    }

    /// Average latency across all retained rows for one credential, or
    /// `0.0` if it has none.
    #[must_use]
    pub fn average_latency_ms(&self, credential_id: &str) -> f64 {
        let samples: Vec<u64> = self.rows_for(credential_id).map(|r| r.latency_ms).collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }

    /// 95th-percentile latency across all retained rows for one credential,
    /// or `0.0` if it has none. Nearest-rank method over the sorted samples.
    #[must_use]
    pub fn p95_latency_ms(&self, credential_id: &str) -> f64 {
        let mut samples: Vec<u64> = self.rows_for(credential_id).map(|r| r.latency_ms).collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_unstable();
        let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
        let index = rank.saturating_sub(1).min(samples.len() - 1);
        samples[index] as f64
    }

    /// Counts `(requests, successes, errors)` across all retained rows for
    /// one credential.
    #[must_use]
    pub fn counts_for(&self, credential_id: &str) -> (u64, u64, u64) {
        let mut requests = 0;
        let mut successes = 0;
        let mut errors = 0;
        for row in self.rows_for(credential_id) {
            requests += 1;
            match row.outcome {
                Outcome::Success => successes += 1,
                Outcome::Error => errors += 1,
            }
        }
        (requests, successes, errors)
    }
}

/// One credential's worth of gauges, ready to be rendered.
#[derive(Debug, Clone)]
pub struct CredentialGauges {
    /// Credential id, used as the Prometheus label value.
    pub id: String,
    /// Health score in `[0, 1]`.
    pub health_score: f64,
    /// `1.0` if the circuit is CLOSED, else `0.0`.
    pub circuit_closed: f64,
    /// Total requests recorded in the retained window.
    pub requests_total: u64,
    /// Total errors recorded in the retained window.
    pub errors_total: u64,
}

/// Render the full Prometheus text-exposition body for a set of
/// credentials. Intentionally hand-rolled `format!` output, matching the
/// one example in the pack that already avoids the `prometheus` crate.
#[must_use]
pub fn render_prometheus(gauges: &[CredentialGauges]) -> String {
    let mut out = String::new();
    out.push_str("# HELP gateway_credential_health_score Sliding-window success ratio in [0,1]\n");
    out.push_str("# TYPE gateway_credential_health_score gauge\n");
    for g in gauges {
        out.push_str(&format!(
            "gateway_credential_health_score{{credential=\"{}\"}} {}\n",
            g.id, g.health_score
        ));
    }
    out.push_str("# HELP gateway_credential_circuit_closed 1 if the circuit breaker is CLOSED\n");
    out.push_str("# TYPE gateway_credential_circuit_closed gauge\n");
    for g in gauges {
        out.push_str(&format!(
            "gateway_credential_circuit_closed{{credential=\"{}\"}} {}\n",
            g.id, g.circuit_closed
        ));
    }
    out.push_str("# HELP gateway_credential_requests_total Requests served by this credential\n");
    out.push_str("# TYPE gateway_credential_requests_total counter\n");
    for g in gauges {
        out.push_str(&format!(
            "gateway_credential_requests_total{{credential=\"{}\"}} {}\n",
            g.id, g.requests_total
        ));
    }
    out.push_str("# HELP gateway_credential_errors_total Errors observed for this credential\n");
    out.push_str("# TYPE gateway_credential_errors_total counter\n");
    for g in gauges {
        out.push_str(&format!(
            "gateway_credential_errors_total{{credential=\"{}\"}} {}\n",
            g.id, g.errors_total
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, outcome: Outcome, latency_ms: u64) -> RequestMetric {
        RequestMetric {
            credential_id: id.to_string(),
            timestamp: Utc::now(),
            outcome,
            latency_ms,
        }
    }

    #[test]
    fn log_evicts_oldest_past_capacity() {
        let mut log = MetricsLog::new();
        for i in 0..(MAX_HISTORY + 10) {
            log.record(row("k1", Outcome::Success, i as u64));
        }
        assert_eq!(log.rows().count(), MAX_HISTORY);
    }

    #[test]
    fn counts_split_success_and_error() {
        let mut log = MetricsLog::new();
        log.record(row("k1", Outcome::Success, 10));
        log.record(row("k1", Outcome::Error, 20));
        log.record(row("k2", Outcome::Success, 5));
        let (requests, successes, errors) = log.counts_for("k1");
        assert_eq!((requests, successes, errors), (2, 1, 1));
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let mut log = MetricsLog::new();
        for ms in [10, 20, 30, 40, 100] {
            log.record(row("k1", Outcome::Success, ms));
        }
        assert_eq!(log.p95_latency_ms("k1"), 100.0);
    }

    #[test]
    fn prometheus_output_includes_all_gauge_families() {
        let gauges = vec![CredentialGauges {
            id: "k1".to_string(),
            health_score: 0.9,
            circuit_closed: 1.0,
            requests_total: 5,
            errors_total: 1,
        }];
        let text = render_prometheus(&gauges);
        assert!(text.contains("gateway_credential_health_score{credential=\"k1\"} 0.9"));
        assert!(text.contains("gateway_credential_requests_total{credential=\"k1\"} 5"));
    }
}
