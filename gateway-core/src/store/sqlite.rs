//! Primary State Store: an indexed, transactional SQLite backend.
//!
//! `rusqlite` is synchronous; every call wraps its blocking work in
//! `spawn_blocking` to keep it off the async runtime.

use super::{CredentialEntry, PoolSnapshot, StoreError, UsageStats, UsageWindow};
use crate::circuit::{CircuitSnapshot, CircuitState};
use crate::credential::CredentialRecord;
use crate::health::HealthSnapshot;
use crate::metrics::{Outcome, RequestMetric};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY,
    secret TEXT NOT NULL,
    weight INTEGER NOT NULL,
    active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    cooldown_secs INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS health_snapshots (
    credential_id TEXT PRIMARY KEY REFERENCES credentials(id),
    success_count INTEGER NOT NULL,
    failure_count INTEGER NOT NULL,
    window_start TEXT NOT NULL,
    last_updated TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS circuit_snapshots (
    credential_id TEXT PRIMARY KEY REFERENCES credentials(id),
    state TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    last_failure_at TEXT,
    opened_at TEXT,
    probe_in_flight INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS request_metrics_history (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    credential_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    outcome TEXT NOT NULL,
    latency_ms INTEGER NOT NULL
);
";

/// A SQLite-backed `State Store`.
///
/// `rusqlite::Connection` is `!Sync`, and every operation here needs to move
/// into a `spawn_blocking` closure, so the store holds only the file path
/// and opens a short-lived connection per call rather than guarding one
/// long-lived connection behind a lock.
pub struct SqliteStore {
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (creating if absent) the database at `path` and ensure the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { path: path.to_path_buf() })
    }

    /// Load the full persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn load(&self) -> Result<PoolSnapshot, StoreError> {
        let conn = self.clone_handle();
        tokio::task::spawn_blocking(move || load_blocking(&conn))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// Overwrite the full snapshot: every credential triple, upserted one
    /// at a time in a single transaction. Metric rows are left untouched:
    /// the history is append-only and not part of a credential save.
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn save(&self, snapshot: PoolSnapshot) -> Result<(), StoreError> {
        let conn = self.clone_handle();
        tokio::task::spawn_blocking(move || save_blocking(&conn, &snapshot))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// Atomically upsert one credential's full triple.
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn upsert_key(&self, entry: CredentialEntry) -> Result<(), StoreError> {
        let conn = self.clone_handle();
        tokio::task::spawn_blocking(move || upsert_blocking(&conn, &entry))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// Append one request-metric row, trimming history past
    /// [`crate::metrics::MAX_HISTORY`].
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn record_request_metric(&self, metric: RequestMetric) -> Result<(), StoreError> {
        let conn = self.clone_handle();
        tokio::task::spawn_blocking(move || record_metric_blocking(&conn, &metric))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// Per-credential usage aggregated over the last 24 hours.
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn daily_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        self.usage_stats(UsageWindow::Daily).await
    }

    /// Per-credential usage aggregated over the last 7 days.
    ///
    /// # Errors
    ///
    /// Returns an error on any underlying SQL failure.
    pub async fn weekly_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        self.usage_stats(UsageWindow::Weekly).await
    }

    async fn usage_stats(&self, window: UsageWindow) -> Result<Vec<UsageStats>, StoreError> {
        let cutoff = window.cutoff(Utc::now());
        let conn = self.clone_handle();
        tokio::task::spawn_blocking(move || usage_stats_blocking(&conn, cutoff))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// The path, cloned for capture into a `spawn_blocking` closure.
    fn clone_handle(&self) -> PathBuf {
        self.path.clone()
    }
}

fn with_connection<T>(path: &Path, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, StoreError> {
    let conn = Connection::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
    f(&conn).map_err(|e| StoreError::Io(e.to_string()))
}

fn load_blocking(path: &Path) -> Result<PoolSnapshot, StoreError> {
    with_connection(path, |conn| {
        let mut records_stmt = conn.prepare(
            "SELECT id, secret, weight, active, created_at, last_used_at, cooldown_secs FROM credentials",
        )?;
        let mut credentials = Vec::new();
        let rows = records_stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let created_at: String = row.get(4)?;
            let last_used_at: Option<String> = row.get(5)?;
            let cooldown_secs: i64 = row.get(6)?;
            Ok((
                CredentialRecord {
                    id: id.clone(),
                    secret: row.get(1)?,
                    weight: row.get::<_, i64>(2)? as u32,
                    active: row.get::<_, i64>(3)? != 0,
                    created_at: parse_ts(&created_at),
                    last_used_at: last_used_at.as_deref().map(parse_ts),
                    cooldown: std::time::Duration::from_secs(cooldown_secs.max(0) as u64),
                },
                id,
            ))
        })?;
        for row in rows {
            let (record, id) = row?;
            let health = load_health(conn, &id)?;
            let circuit = load_circuit(conn, &id)?;
            credentials.push(CredentialEntry { record, health, circuit });
        }
        drop(records_stmt);

        let mut metrics_stmt =
            conn.prepare("SELECT credential_id, timestamp, outcome, latency_ms FROM request_metrics_history ORDER BY row_id ASC")?;
        let metrics = metrics_stmt
            .query_map([], |row| {
                let timestamp: String = row.get(1)?;
                let outcome: String = row.get(2)?;
                Ok(RequestMetric {
                    credential_id: row.get(0)?,
                    timestamp: parse_ts(&timestamp),
                    outcome: if outcome == "success" { Outcome::Success } else { Outcome::Error },
                    latency_ms: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PoolSnapshot { credentials, metrics })
    })
}

fn load_health(conn: &Connection, id: &str) -> rusqlite::Result<HealthSnapshot> {
    conn.query_row(
        "SELECT success_count, failure_count, window_start, last_updated FROM health_snapshots WHERE credential_id = ?1",
        [id],
        |row| {
            let window_start: String = row.get(2)?;
            let last_updated: String = row.get(3)?;
            Ok(HealthSnapshot {
                success_count: row.get::<_, i64>(0)? as u64,
                failure_count: row.get::<_, i64>(1)? as u64,
                window_start: parse_ts(&window_start),
                last_updated: parse_ts(&last_updated),
            })
        },
    )
    .or_else(|_| Ok(HealthSnapshot::new(Utc::now())))
}

fn load_circuit(conn: &Connection, id: &str) -> rusqlite::Result<CircuitSnapshot> {
    conn.query_row(
        "SELECT state, consecutive_failures, last_failure_at, opened_at, probe_in_flight FROM circuit_snapshots WHERE credential_id = ?1",
        [id],
        |row| {
            let state: String = row.get(0)?;
            let last_failure_at: Option<String> = row.get(2)?;
            let opened_at: Option<String> = row.get(3)?;
            Ok(CircuitSnapshot {
                state: parse_state(&state),
                consecutive_failures: row.get::<_, i64>(1)? as u32,
                last_failure_at: last_failure_at.as_deref().map(parse_ts),
                opened_at: opened_at.as_deref().map(parse_ts),
                probe_in_flight: row.get::<_, i64>(4)? != 0,
            })
        },
    )
    .or_else(|_| Ok(CircuitSnapshot::new()))
}

fn save_blocking(path: &Path, snapshot: &PoolSnapshot) -> Result<(), StoreError> {
    for entry in &snapshot.credentials {
        upsert_blocking(path, entry)?;
    }
    Ok(())
}

fn upsert_blocking(path: &Path, entry: &CredentialEntry) -> Result<(), StoreError> {
    with_connection(path, |conn| {
        conn.execute(
            "INSERT INTO credentials (id, secret, weight, active, created_at, last_used_at, cooldown_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                secret = excluded.secret,
                weight = excluded.weight,
                active = excluded.active,
                last_used_at = excluded.last_used_at,
                cooldown_secs = excluded.cooldown_secs",
            rusqlite::params![
                entry.record.id,
                entry.record.secret,
                i64::from(entry.record.weight),
                i64::from(entry.record.active),
                entry.record.created_at.to_rfc3339(),
                entry.record.last_used_at.map(|t| t.to_rfc3339()),
                entry.record.cooldown.as_secs() as i64,
            ],
        )?;
        conn.execute(
            "INSERT INTO health_snapshots (credential_id, success_count, failure_count, window_start, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(credential_id) DO UPDATE SET
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                window_start = excluded.window_start,
                last_updated = excluded.last_updated",
            rusqlite::params![
                entry.record.id,
                entry.health.success_count as i64,
                entry.health.failure_count as i64,
                entry.health.window_start.to_rfc3339(),
                entry.health.last_updated.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "INSERT INTO circuit_snapshots (credential_id, state, consecutive_failures, last_failure_at, opened_at, probe_in_flight)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(credential_id) DO UPDATE SET
                state = excluded.state,
                consecutive_failures = excluded.consecutive_failures,
                last_failure_at = excluded.last_failure_at,
                opened_at = excluded.opened_at,
                probe_in_flight = excluded.probe_in_flight",
            rusqlite::params![
                entry.record.id,
                state_str(entry.circuit.state),
                entry.circuit.consecutive_failures,
                entry.circuit.last_failure_at.map(|t| t.to_rfc3339()),
                entry.circuit.opened_at.map(|t| t.to_rfc3339()),
                i64::from(entry.circuit.probe_in_flight),
            ],
        )?;
        Ok(())
    })
}

fn record_metric_blocking(path: &Path, metric: &RequestMetric) -> Result<(), StoreError> {
    with_connection(path, |conn| {
        conn.execute(
            "INSERT INTO request_metrics_history (credential_id, timestamp, outcome, latency_ms) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                metric.credential_id,
                metric.timestamp.to_rfc3339(),
                outcome_str(metric.outcome),
                metric.latency_ms as i64,
            ],
        )?;
        conn.execute(
            "DELETE FROM request_metrics_history WHERE row_id NOT IN (
                SELECT row_id FROM request_metrics_history ORDER BY row_id DESC LIMIT ?1
            )",
            rusqlite::params![crate::metrics::MAX_HISTORY as i64],
        )?;
        Ok(())
    })
}

fn usage_stats_blocking(path: &Path, cutoff: DateTime<Utc>) -> Result<Vec<UsageStats>, StoreError> {
    with_connection(path, |conn| {
        let mut stmt = conn.prepare(
            "SELECT credential_id, timestamp, outcome, latency_ms FROM request_metrics_history WHERE timestamp >= ?1",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![cutoff.to_rfc3339()], |row| {
                let timestamp: String = row.get(1)?;
                let outcome: String = row.get(2)?;
                Ok(RequestMetric {
                    credential_id: row.get(0)?,
                    timestamp: parse_ts(&timestamp),
                    outcome: if outcome == "success" { Outcome::Success } else { Outcome::Error },
                    latency_ms: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(super::aggregate_usage(&rows, cutoff))
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn state_str(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

fn parse_state(raw: &str) -> CircuitState {
    match raw {
        "open" => CircuitState::Open,
        "half_open" => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

fn outcome_str(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::Error => "error",
    }
}
