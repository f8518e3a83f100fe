//! State Store (C2) and Resilient Store (C3).
//!
//! Two concrete backends ([`sqlite::SqliteStore`], [`document::DocumentStore`])
//! implement the same operation set as inherent methods with matching
//! signatures: a tagged sum type rather than a trait object.
//! [`resilient::ResilientStore`] is a decorator over the pair.

pub mod document;
pub mod resilient;
pub mod sqlite;

use crate::circuit::CircuitSnapshot;
use crate::credential::CredentialRecord;
use crate::health::HealthSnapshot;
use crate::metrics::RequestMetric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The full persisted state of one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// The stable, mostly-static record.
    pub record: CredentialRecord,
    /// Its health window.
    pub health: HealthSnapshot,
    /// Its circuit breaker state.
    pub circuit: CircuitSnapshot,
}

/// A full point-in-time snapshot of everything a Store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// One entry per credential, keyed externally by `entry.record.id`.
    pub credentials: Vec<CredentialEntry>,
    /// Retained request-metric history, oldest first, capped at
    /// [`crate::metrics::MAX_HISTORY`].
    pub metrics: Vec<RequestMetric>,
}

/// Per-credential aggregate over a time window, as returned by the usage
/// rollup queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// The credential these stats describe.
    pub credential_id: String,
    /// Requests observed since the cutoff.
    pub requests: u64,
    /// Successes observed since the cutoff.
    pub successes: u64,
    /// Errors observed since the cutoff.
    pub errors: u64,
}

/// Failure modes common to both Store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing file or database could not be opened or written.
    #[error("store I/O failure: {0}")]
    Io(String),
    /// The persisted data could not be (de)serialized.
    #[error("store (de)serialization failure: {0}")]
    Serde(String),
}

/// Since-when an aggregate usage query should sum from.
#[derive(Debug, Clone, Copy)]
pub enum UsageWindow {
    /// Rows from the last 24 hours.
    Daily,
    /// Rows from the last 7 days.
    Weekly,
}

impl UsageWindow {
    /// The cutoff timestamp this window implies, relative to `now`.
    #[must_use]
    pub fn cutoff(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily => now - chrono::Duration::hours(24),
            Self::Weekly => now - chrono::Duration::days(7),
        }
    }
}

/// Aggregate a flat list of metric rows into per-credential [`UsageStats`]
/// since `cutoff`. Shared by both backends so the rollup logic (and its
/// tests) live in one place.
#[must_use]
pub fn aggregate_usage(rows: &[RequestMetric], cutoff: DateTime<Utc>) -> Vec<UsageStats> {
    use std::collections::BTreeMap;
    let mut by_credential: BTreeMap<String, UsageStats> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.timestamp >= cutoff) {
        let entry = by_credential.entry(row.credential_id.clone()).or_insert_with(|| UsageStats {
            credential_id: row.credential_id.clone(),
            requests: 0,
            successes: 0,
            errors: 0,
        });
        entry.requests += 1;
        match row.outcome {
            crate::metrics::Outcome::Success => entry.successes += 1,
            crate::metrics::Outcome::Error => entry.errors += 1,
        }
    }
    by_credential.into_values().collect()
}
