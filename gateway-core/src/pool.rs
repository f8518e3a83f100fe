//! Key Manager (C7): the sole mutator of the per-credential triples.
//!
//! Holds the whole pool behind one `std::sync::Mutex` with short critical
//! sections; metric emission and logging happen after the guard drops.

use crate::circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::config::MonitoringPolicy;
use crate::credential::{CredentialConfig, CredentialRecord};
use crate::health::{HealthSnapshot, HealthTracker, HealthTrackerConfig};
use crate::metrics::{MetricsLog, Outcome, RequestMetric};
use crate::selector::{self, Candidate};
use crate::store::resilient::ResilientStore;
use crate::store::CredentialEntry;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A credential's externally-visible lifecycle state, derived from
/// `active` and the circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedStatus {
    /// Administratively disabled.
    Disabled,
    /// Circuit CLOSED and active.
    Active,
    /// Circuit HALF_OPEN and active.
    CircuitHalfOpen,
    /// Circuit OPEN and active.
    CircuitOpen,
}

impl DerivedStatus {
    fn of(record: &CredentialRecord, circuit: &CircuitSnapshot) -> Self {
        if !record.active {
            return Self::Disabled;
        }
        match circuit.state {
            CircuitState::Closed => Self::Active,
            CircuitState::HalfOpen => Self::CircuitHalfOpen,
            CircuitState::Open => Self::CircuitOpen,
        }
    }

    /// The lowercase wire form used in admin/listing responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Active => "active",
            Self::CircuitHalfOpen => "circuit_half_open",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// A single credential's full in-memory state.
#[derive(Debug, Clone)]
struct KeyState {
    record: CredentialRecord,
    health: HealthSnapshot,
    circuit: CircuitSnapshot,
}

/// Read-only summary of one credential, as returned by [`KeyManager::list_keys`].
#[derive(Debug, Clone)]
pub struct KeySummary {
    /// Stable id.
    pub id: String,
    /// Derived lifecycle status.
    pub status: DerivedStatus,
    /// Health score, already rounded to 2 decimal places for display.
    pub score: f64,
    /// Last time this credential served a request.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Consecutive failure count on the circuit breaker.
    pub failure_count: u32,
    /// When the next HALF_OPEN probe becomes eligible, if OPEN/HALF_OPEN.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Configured weight.
    pub weight: u32,
}

/// Summary returned by [`KeyManager::health_summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    /// At least one credential is active.
    Healthy,
    /// No credential is active, but at least one isn't disabled.
    Degraded,
    /// Every credential is disabled, or the pool is empty.
    Unhealthy,
}

/// Counts backing [`PoolHealth`] and the admin health endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCounts {
    /// Total configured credentials.
    pub total: usize,
    /// Credentials with derived status `active`.
    pub healthy: usize,
    /// Credentials that are active but circuit-degraded (HALF_OPEN/OPEN).
    pub unhealthy: usize,
    /// Administratively disabled credentials.
    pub disabled: usize,
}

/// Counts returned by [`KeyManager::reconcile`], for the admin reload
/// response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    /// Credentials newly present in the config.
    pub added: usize,
    /// Credentials no longer present in the config.
    pub removed: usize,
    /// Credentials present before and after, with mutable fields updated.
    pub updated: usize,
}

struct Monitoring {
    health: HealthTracker,
    circuit: CircuitBreaker,
}

impl Monitoring {
    fn new(policy: &MonitoringPolicy) -> Self {
        Self {
            health: HealthTracker::new(HealthTrackerConfig {
                window: Duration::from_secs(policy.window_seconds),
            }),
            circuit: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: policy.failure_threshold,
                open_cooldown: Duration::from_secs(policy.recovery_time_seconds),
            }),
        }
    }
}

struct Inner {
    keys: HashMap<String, KeyState>,
    monitoring: Monitoring,
    metrics: MetricsLog,
}

/// Aggregate owner of all per-credential state (C7).
///
/// `store` is write-through but best-effort: every mutating operation
/// attempts an `upsert_key`/`record_request_metric` after releasing the
/// pool lock, and logs (never panics or propagates) on failure.
pub struct KeyManager {
    inner: Mutex<Inner>,
    store: std::sync::Arc<ResilientStore>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Bootstrap the pool from configured credentials and a loaded
    /// snapshot: ids in both are adopted with persisted health/circuit;
    /// ids only in config get fresh state; ids only in the snapshot are
    /// dropped.
    #[must_use]
    pub fn bootstrap(
        configured: &[CredentialConfig],
        snapshot_entries: Vec<CredentialEntry>,
        monitoring_policy: &MonitoringPolicy,
        store: std::sync::Arc<ResilientStore>,
    ) -> Self {
        let mut persisted: HashMap<String, CredentialEntry> =
            snapshot_entries.into_iter().map(|e| (e.record.id.clone(), e)).collect();

        let mut keys = HashMap::new();
        for cfg in configured {
            if let Some(entry) = persisted.remove(&cfg.name) {
                let mut record = entry.record;
                record.secret = cfg.key.clone();
                record.weight = cfg.weight();
                record.cooldown = cfg.cooldown();
                keys.insert(cfg.name.clone(), KeyState { record, health: entry.health, circuit: entry.circuit });
            } else {
                let record = CredentialRecord::new(cfg.name.clone(), cfg.key.clone(), cfg.weight(), cfg.cooldown());
                keys.insert(
                    cfg.name.clone(),
                    KeyState {
                        record,
                        health: HealthSnapshot::new(Utc::now()),
                        circuit: CircuitSnapshot::new(),
                    },
                );
            }
        }

        Self {
            inner: Mutex::new(Inner {
                keys,
                monitoring: Monitoring::new(monitoring_policy),
                metrics: MetricsLog::new(),
            }),
            store,
        }
    }

    /// Reconcile against a freshly hot-reloaded credential list: adds new
    /// ids, updates mutable fields (weight, cooldown, secret) in place on
    /// existing ids while preserving persisted health/circuit and the admin
    /// `active` override, and prunes ids no longer configured.
    pub fn reconcile(&self, configured: &[CredentialConfig]) -> ReconcileCounts {
        let mut counts = ReconcileCounts::default();
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let configured_ids: std::collections::HashSet<&str> = configured.iter().map(|c| c.name.as_str()).collect();
        let before_ids: Vec<String> = inner.keys.keys().cloned().collect();
        for id in before_ids {
            if !configured_ids.contains(id.as_str()) {
                inner.keys.remove(&id);
                counts.removed += 1;
            }
        }

        for cfg in configured {
            if let Some(existing) = inner.keys.get_mut(&cfg.name) {
                existing.record.secret = cfg.key.clone();
                existing.record.weight = cfg.weight();
                existing.record.cooldown = cfg.cooldown();
                counts.updated += 1;
            } else {
                let record = CredentialRecord::new(cfg.name.clone(), cfg.key.clone(), cfg.weight(), cfg.cooldown());
                inner.keys.insert(
                    cfg.name.clone(),
                    KeyState {
                        record,
                        health: HealthSnapshot::new(Utc::now()),
                        circuit: CircuitSnapshot::new(),
                    },
                );
                counts.added += 1;
            }
        }

        counts
    }

    /// Apply new monitoring thresholds. Existing triples are retained
    /// as-is; only the tracker/breaker parameters used for future
    /// evaluations change.
    pub fn update_monitoring_config(&self, policy: &MonitoringPolicy) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.monitoring = Monitoring::new(policy);
    }

    /// Select an eligible credential, if any. Eligibility is
    /// `active ∧ circuit ∈ {CLOSED, HALF_OPEN}` with a HALF_OPEN candidate
    /// only eligible if it successfully claims the single probe slot, and
    /// not within its post-use cooldown window.
    ///
    /// Callers must report the outcome via [`Self::record_success`]/
    /// [`Self::record_failure`] exactly once for the returned id.
    #[must_use]
    pub fn select_key(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let circuit = inner.monitoring.circuit;

        // Survey with `would_admit`, not `admit`: surveying must not mutate
        // circuit state, or every probe-eligible credential but the one
        // `selector::select` eventually picks would be left with a claimed
        // probe slot (or an OPEN->HALF_OPEN transition) it never gets to use.
        let mut candidates = Vec::new();
        for state in inner.keys.values() {
            if !state.record.active {
                continue;
            }
            if state.record.in_cooldown(now) {
                continue;
            }
            match circuit.would_admit(&state.circuit, now) {
                Admission::Allowed | Admission::Probe => {
                    candidates.push(Candidate {
                        id: state.record.id.clone(),
                        weight: state.record.weight,
                    });
                }
                Admission::Rejected => {}
            }
        }

        let mut rng = OsRng;
        let selected = selector::select(&candidates, &mut rng)?;

        // Only the selected credential actually claims a probe slot.
        if let Some(state) = inner.keys.get_mut(&selected) {
            circuit.admit(&mut state.circuit, now);
        }

        Some(selected)
    }

    /// The credential secret backing `id`, for the caller to attach to the
    /// upstream request. `None` if `id` is unknown.
    #[must_use]
    pub fn credential_secret(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.keys.get(id).map(|state| state.record.secret.clone())
    }

    /// Record a successful upstream call against `id`.
    ///
    /// No-op if `id` is unknown (e.g. it was removed by a reload that
    /// raced with an in-flight request).
    pub fn record_success(&self, id: &str, latency_ms: u64) {
        let flushed = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            let Some(state) = inner.keys.get_mut(id) else {
                return;
            };
            inner.monitoring.health.record_success(&mut state.health, now);
            if state.circuit.state == CircuitState::HalfOpen {
                inner.monitoring.circuit.on_probe_result(&mut state.circuit, true, now);
            } else {
                inner.monitoring.circuit.record_success(&mut state.circuit);
            }
            state.record.last_used_at = Some(now);
            let metric = RequestMetric {
                credential_id: id.to_string(),
                timestamp: now,
                outcome: Outcome::Success,
                latency_ms,
            };
            inner.metrics.record(metric.clone());
            (
                CredentialEntry {
                    record: state.record.clone(),
                    health: state.health.clone(),
                    circuit: state.circuit.clone(),
                },
                metric,
            )
        };
        self.flush_best_effort(flushed.0, flushed.1);
    }

    /// Record a failed upstream call against `id`.
    ///
    /// `is_rate_limit` trips the breaker open immediately regardless of the
    /// failure threshold. No-op if `id` is unknown.
    pub fn record_failure(&self, id: &str, is_rate_limit: bool, latency_ms: u64) {
        let flushed = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            let Some(state) = inner.keys.get_mut(id) else {
                return;
            };
            inner.monitoring.health.record_failure(&mut state.health, now);
            if state.circuit.state == CircuitState::HalfOpen {
                inner.monitoring.circuit.on_probe_result(&mut state.circuit, false, now);
            } else if is_rate_limit {
                inner.monitoring.circuit.record_rate_limited(&mut state.circuit, now);
            } else {
                inner.monitoring.circuit.record_failure(&mut state.circuit, now);
            }
            let metric = RequestMetric {
                credential_id: id.to_string(),
                timestamp: now,
                outcome: Outcome::Error,
                latency_ms,
            };
            inner.metrics.record(metric.clone());
            (
                CredentialEntry {
                    record: state.record.clone(),
                    health: state.health.clone(),
                    circuit: state.circuit.clone(),
                },
                metric,
            )
        };
        self.flush_best_effort(flushed.0, flushed.1);
    }

    /// Flip `active` to `false`. Returns `false` if `id` is unknown.
    pub fn disable_key(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(state) = inner.keys.get_mut(id) else {
            return false;
        };
        state.record.active = false;
        true
    }

    /// Flip `active` to `true` and reset circuit and health state. Returns
    /// `false` if `id` is unknown.
    pub fn enable_key(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(state) = inner.keys.get_mut(id) else {
            return false;
        };
        state.record.active = true;
        state.circuit = CircuitSnapshot::new();
        state.health = HealthSnapshot::new(Utc::now());
        true
    }

    /// Summaries of every credential, for `listKeys` / `GET /admin/keys`.
    #[must_use]
    pub fn list_keys(&self) -> Vec<KeySummary> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let circuit = inner.monitoring.circuit;
        inner
            .keys
            .values()
            .map(|state| KeySummary {
                id: state.record.id.clone(),
                status: DerivedStatus::of(&state.record, &state.circuit),
                score: (state.health.score() * 100.0).round() / 100.0,
                last_used_at: state.record.last_used_at,
                failure_count: state.circuit.consecutive_failures,
                next_attempt: circuit.next_attempt(&state.circuit),
                weight: state.record.weight,
            })
            .collect()
    }

    /// Per-credential Prometheus gauges, for `GET /admin/metrics`.
    #[must_use]
    pub fn credential_gauges(&self) -> Vec<crate::metrics::CredentialGauges> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .keys
            .values()
            .map(|state| {
                let (requests_total, _, errors_total) = inner.metrics.counts_for(&state.record.id);
                crate::metrics::CredentialGauges {
                    id: state.record.id.clone(),
                    health_score: state.health.score(),
                    circuit_closed: f64::from(u8::from(state.circuit.state == CircuitState::Closed)),
                    requests_total,
                    errors_total,
                }
            })
            .collect()
    }

    /// Number of credentials whose derived status is `active`.
    #[must_use]
    pub fn active_key_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .keys
            .values()
            .filter(|state| DerivedStatus::of(&state.record, &state.circuit) == DerivedStatus::Active)
            .count()
    }

    /// The retry loop's attempt budget: `max(1, activeKeyCount)`.
    #[must_use]
    pub fn attempt_budget(&self) -> usize {
        self.active_key_count().max(1)
    }

    /// Pool-wide health summary and counts, for `GET /admin/health` and
    /// `GET /healthz`.
    #[must_use]
    pub fn health_summary(&self) -> (PoolHealth, PoolCounts) {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut counts = PoolCounts { total: inner.keys.len(), ..PoolCounts::default() };
        for state in inner.keys.values() {
            match DerivedStatus::of(&state.record, &state.circuit) {
                DerivedStatus::Active => counts.healthy += 1,
                DerivedStatus::Disabled => counts.disabled += 1,
                DerivedStatus::CircuitHalfOpen | DerivedStatus::CircuitOpen => counts.unhealthy += 1,
            }
        }
        let health = if counts.healthy > 0 {
            PoolHealth::Healthy
        } else if counts.unhealthy > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        };
        (health, counts)
    }

    /// Fire-and-forget write-through: callers of `record_success`/
    /// `record_failure` run in an async handler, but the in-memory update
    /// above only needed a `std::sync::Mutex`, so the storage write is
    /// spawned rather than awaited on the caller's path.
    fn flush_best_effort(&self, entry: CredentialEntry, metric: RequestMetric) {
        let store = self.store.clone();
        let id = entry.record.id.clone();
        tokio::spawn(async move {
            if let Err(err) = store.upsert_key(entry).await {
                tracing::warn!(error = %err, credential = %id, "best-effort state flush failed");
            }
            if let Err(err) = store.record_request_metric(metric).await {
                tracing::warn!(error = %err, credential = %id, "best-effort metric flush failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::DocumentStore;
    use crate::store::sqlite::SqliteStore;

    fn manager(dir: &std::path::Path, configs: &[CredentialConfig]) -> KeyManager {
        let primary = SqliteStore::open(&dir.join("primary.sqlite3")).unwrap();
        let fallback = DocumentStore::new(dir.join("fallback.json"));
        let store = std::sync::Arc::new(ResilientStore::new(primary, fallback));
        KeyManager::bootstrap(configs, Vec::new(), &MonitoringPolicy::default(), store)
    }

    fn cfg(name: &str, weight: u32) -> CredentialConfig {
        CredentialConfig {
            name: name.to_string(),
            key: format!("secret-{name}"),
            weight: Some(weight),
            cooldown_seconds: Some(0),
        }
    }

    #[tokio::test]
    async fn select_key_returns_none_when_pool_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[]);
        assert_eq!(manager.select_key(), None);
    }

    #[tokio::test]
    async fn disabled_credential_is_never_selected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        assert!(manager.disable_key("k1"));
        assert_eq!(manager.select_key(), None);
    }

    #[tokio::test]
    async fn open_circuit_excludes_credential_from_selection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1), cfg("k2", 1)]);
        for _ in 0..5 {
            manager.record_failure("k1", false, 10);
        }
        for _ in 0..50 {
            assert_eq!(manager.select_key().as_deref(), Some("k2"));
        }
    }

    #[tokio::test]
    async fn reconcile_adds_and_removes_by_id_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        let counts = manager.reconcile(&[cfg("k2", 1)]);
        assert_eq!(counts, ReconcileCounts { added: 1, removed: 1, updated: 0 });
        assert_eq!(manager.select_key().as_deref(), Some("k2"));
    }

    #[tokio::test]
    async fn reconcile_preserves_health_and_circuit_for_retained_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1), cfg("k2", 1)]);
        for _ in 0..5 {
            manager.record_failure("k1", false, 10);
        }
        manager.reconcile(&[cfg("k1", 3), cfg("k2", 1)]);
        let summary = manager.list_keys().into_iter().find(|s| s.id == "k1").unwrap();
        assert_eq!(summary.status, DerivedStatus::CircuitOpen, "circuit state must survive reconcile");
        assert_eq!(summary.weight, 3, "weight is a mutable field updated in place");
    }

    #[tokio::test]
    async fn enable_key_resets_circuit_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        for _ in 0..5 {
            manager.record_failure("k1", false, 10);
        }
        assert!(manager.enable_key("k1"));
        let summary = manager.list_keys().into_iter().find(|s| s.id == "k1").unwrap();
        assert_eq!(summary.status, DerivedStatus::Active);
        assert_eq!(summary.failure_count, 0);
    }

    #[tokio::test]
    async fn unknown_id_operations_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        assert!(!manager.disable_key("missing"));
        assert!(!manager.enable_key("missing"));
        manager.record_success("missing", 1);
        manager.record_failure("missing", false, 1);
    }

    #[tokio::test]
    async fn health_summary_reports_healthy_when_any_active() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        let (health, counts) = manager.health_summary();
        assert_eq!(health, PoolHealth::Healthy);
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn health_summary_reports_unhealthy_when_all_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[cfg("k1", 1)]);
        manager.disable_key("k1");
        let (health, _) = manager.health_summary();
        assert_eq!(health, PoolHealth::Unhealthy);
    }
}
