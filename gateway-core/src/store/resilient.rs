//! Resilient Store (C3): a decorator over [`SqliteStore`] and
//! [`DocumentStore`] that fails over on error and never flaps back.
//!
//! The demotion flag is the one piece of mutable shared state this type
//! owns; everything else delegates straight through to whichever backend is
//! currently primary. Modeled on the "decorator over two sum-type variants"
//! design note rather than a trait object, so there is no `dyn Store` and
//! no need for `async-trait`.

use super::document::DocumentStore;
use super::sqlite::SqliteStore;
use super::{CredentialEntry, PoolSnapshot, StoreError, UsageStats};
use crate::metrics::RequestMetric;
use std::sync::atomic::{AtomicBool, Ordering};

/// Wraps a primary (SQLite) and fallback (JSON document) store.
///
/// Every write attempts the primary first. On failure it logs, retries the
/// same operation against the fallback, and sets `demoted` permanently:
/// from that point on, for the rest of the process, every operation (read
/// or write) goes straight to the fallback. A *read* failure on the primary
/// falls through to the fallback for that one answer but does **not** set
/// `demoted`: silent write loss is worse than one stale read.
#[derive(Debug)]
pub struct ResilientStore {
    primary: SqliteStore,
    fallback: DocumentStore,
    demoted: AtomicBool,
}

impl ResilientStore {
    /// Wrap a primary/fallback pair, starting un-demoted.
    #[must_use]
    pub fn new(primary: SqliteStore, fallback: DocumentStore) -> Self {
        Self {
            primary,
            fallback,
            demoted: AtomicBool::new(false),
        }
    }

    /// Whether the primary has been permanently demoted in this process.
    #[must_use]
    pub fn is_demoted(&self) -> bool {
        self.demoted.load(Ordering::SeqCst)
    }

    fn demote(&self) {
        if !self.demoted.swap(true, Ordering::SeqCst) {
            tracing::warn!("primary store failed; permanently demoting to fallback store for this process");
        }
    }

    /// Load the full snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback also fails (after the primary
    /// failed, or when already demoted).
    pub async fn load(&self) -> Result<PoolSnapshot, StoreError> {
        if self.is_demoted() {
            return self.fallback.load().await;
        }
        match self.primary.load().await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "primary store read failed, falling through to fallback for this read only");
                self.fallback.load().await
            }
        }
    }

    /// Atomically upsert one credential's full triple.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback also fails.
    pub async fn upsert_key(&self, entry: CredentialEntry) -> Result<(), StoreError> {
        if self.is_demoted() {
            return self.fallback.upsert_key(entry).await;
        }
        match self.primary.upsert_key(entry.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, credential = %entry.record.id, "primary store write failed");
                self.demote();
                self.fallback.upsert_key(entry).await
            }
        }
    }

    /// Append one request-metric row.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback also fails.
    pub async fn record_request_metric(&self, metric: RequestMetric) -> Result<(), StoreError> {
        if self.is_demoted() {
            return self.fallback.record_request_metric(metric).await;
        }
        match self.primary.record_request_metric(metric.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "primary store write failed");
                self.demote();
                self.fallback.record_request_metric(metric).await
            }
        }
    }

    /// Per-credential usage aggregated over the last 24 hours.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback also fails.
    pub async fn daily_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        if self.is_demoted() {
            return self.fallback.daily_usage_stats().await;
        }
        match self.primary.daily_usage_stats().await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                tracing::warn!(error = %err, "primary store read failed, falling through to fallback for this read only");
                self.fallback.daily_usage_stats().await
            }
        }
    }

    /// Per-credential usage aggregated over the last 7 days.
    ///
    /// # Errors
    ///
    /// Returns an error only if the fallback also fails.
    pub async fn weekly_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        if self.is_demoted() {
            return self.fallback.weekly_usage_stats().await;
        }
        match self.primary.weekly_usage_stats().await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                tracing::warn!(error = %err, "primary store read failed, falling through to fallback for this read only");
                self.fallback.weekly_usage_stats().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitSnapshot;
    use crate::credential::CredentialRecord;
    use crate::health::HealthSnapshot;
    use chrono::Utc;

    fn sample_entry(id: &str) -> CredentialEntry {
        CredentialEntry {
            record: CredentialRecord::new(id.to_string(), "secret".to_string(), 1, std::time::Duration::ZERO),
            health: HealthSnapshot::new(Utc::now()),
            circuit: CircuitSnapshot::new(),
        }
    }

    #[tokio::test]
    async fn writes_go_to_primary_while_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let primary = SqliteStore::open(&dir.path().join("primary.sqlite3")).unwrap();
        let fallback = DocumentStore::new(dir.path().join("fallback.json"));
        let store = ResilientStore::new(primary, fallback);

        store.upsert_key(sample_entry("k1")).await.unwrap();
        assert!(!store.is_demoted());

        let fallback_contents = tokio::fs::read_to_string(dir.path().join("fallback.json")).await;
        assert!(fallback_contents.is_err(), "fallback must stay untouched while primary is healthy");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_failure_permanently_demotes_to_fallback() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let primary_path = dir.path().join("primary.sqlite3");
        let primary = SqliteStore::open(&primary_path).unwrap();
        let fallback = DocumentStore::new(dir.path().join("fallback.json"));
        let store = ResilientStore::new(primary, fallback);

        // Make every subsequent write against the primary file fail.
        let mut perms = std::fs::metadata(&primary_path).unwrap().permissions();
        perms.set_mode(0o444);
        std::fs::set_permissions(&primary_path, perms).unwrap();

        store.upsert_key(sample_entry("k1")).await.unwrap();
        assert!(store.is_demoted(), "a failed write must demote the primary");

        let snapshot = store.fallback.load().await.unwrap();
        assert_eq!(snapshot.credentials.len(), 1, "post-demotion writes land on the fallback");

        // Restore permissions so tempdir cleanup can remove the file.
        let mut perms = std::fs::metadata(&primary_path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&primary_path, perms).unwrap();
    }

    #[tokio::test]
    async fn read_failure_does_not_demote() {
        let dir = tempfile::tempdir().unwrap();
        let primary = SqliteStore::open(&dir.path().join("primary.sqlite3")).unwrap();
        let fallback = DocumentStore::new(dir.path().join("fallback.json"));
        let store = ResilientStore::new(primary, fallback);

        // A healthy primary read succeeds and must not touch `demoted`.
        let _ = store.load().await.unwrap();
        assert!(!store.is_demoted(), "a successful read must never demote");
    }
}
