//! Fallback State Store: a single JSON document on disk.
//!
//! Every operation is read-modify-write against the whole document: there
//! is no index to update in place, only the full pool snapshot.

use super::{CredentialEntry, PoolSnapshot, StoreError, UsageStats, UsageWindow};
use crate::metrics::{RequestMetric, MAX_HISTORY};
use chrono::Utc;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// A JSON-file-backed `State Store`.
///
/// Guarded by an async mutex (not `parking_lot`) because every operation
/// performs file I/O across an await point.
pub struct DocumentStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").field("path", &self.path).finish()
    }
}

impl DocumentStore {
    /// Point a store at `path`. The file is created lazily on first write;
    /// it is fine for it not to exist yet.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    /// Load the full snapshot; an absent or empty file yields the default
    /// (empty) snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but does not parse as a
    /// [`PoolSnapshot`].
    pub async fn load(&self) -> Result<PoolSnapshot, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_document().await
    }

    /// Overwrite the document with `snapshot` in full.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or cannot be serialized.
    pub async fn save(&self, snapshot: &PoolSnapshot) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.write_document(snapshot).await
    }

    /// Read-modify-write: replace or insert `entry` by credential id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write side of the round trip fails.
    pub async fn upsert_key(&self, entry: CredentialEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_document().await?;
        if let Some(existing) = snapshot.credentials.iter_mut().find(|e| e.record.id == entry.record.id) {
            *existing = entry;
        } else {
            snapshot.credentials.push(entry);
        }
        self.write_document(&snapshot).await
    }

    /// Append a metric row, capping the retained history at
    /// [`MAX_HISTORY`] most-recent entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write side of the round trip fails.
    pub async fn record_request_metric(&self, metric: RequestMetric) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_document().await?;
        snapshot.metrics.push(metric);
        if snapshot.metrics.len() > MAX_HISTORY {
            let excess = snapshot.metrics.len() - MAX_HISTORY;
            snapshot.metrics.drain(0..excess);
        }
        self.write_document(&snapshot).await
    }

    /// Per-credential usage aggregated over the last 24 hours.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read.
    pub async fn daily_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        self.usage_stats(UsageWindow::Daily).await
    }

    /// Per-credential usage aggregated over the last 7 days.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read.
    pub async fn weekly_usage_stats(&self) -> Result<Vec<UsageStats>, StoreError> {
        self.usage_stats(UsageWindow::Weekly).await
    }

    async fn usage_stats(&self, window: UsageWindow) -> Result<Vec<UsageStats>, StoreError> {
        let _guard = self.lock.lock().await;
        let snapshot = self.read_document().await?;
        Ok(super::aggregate_usage(&snapshot.metrics, window.cutoff(Utc::now())))
    }

    async fn read_document(&self) -> Result<PoolSnapshot, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(PoolSnapshot::default()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| StoreError::Serde(e.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PoolSnapshot::default()),
            Err(err) => Err(StoreError::Io(err.to_string())),
        }
    }

    async fn write_document(&self, snapshot: &PoolSnapshot) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(snapshot).map_err(|e| StoreError::Serde(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }
        tokio::fs::write(&self.path, contents).await.map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitSnapshot;
    use crate::credential::CredentialRecord;
    use crate::health::HealthSnapshot;
    use crate::metrics::Outcome;

    fn sample_entry(id: &str) -> CredentialEntry {
        CredentialEntry {
            record: CredentialRecord::new(id.to_string(), "secret".to_string(), 1, std::time::Duration::ZERO),
            health: HealthSnapshot::new(Utc::now()),
            circuit: CircuitSnapshot::new(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("nope.json"));
        let snapshot = store.load().await.unwrap();
        assert!(snapshot.credentials.is_empty());
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("state.json"));
        store.upsert_key(sample_entry("k1")).await.unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.credentials.len(), 1);
        assert_eq!(snapshot.credentials[0].record.id, "k1");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_entry_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("state.json"));
        store.upsert_key(sample_entry("k1")).await.unwrap();
        let mut updated = sample_entry("k1");
        updated.record.weight = 7;
        store.upsert_key(updated).await.unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.credentials.len(), 1);
        assert_eq!(snapshot.credentials[0].record.weight, 7);
    }

    #[tokio::test]
    async fn metrics_capped_at_max_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("state.json"));
        for i in 0..(MAX_HISTORY + 3) {
            store
                .record_request_metric(RequestMetric {
                    credential_id: "k1".to_string(),
                    timestamp: Utc::now(),
                    outcome: Outcome::Success,
                    latency_ms: i as u64,
                })
                .await
                .unwrap();
        }
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.metrics.len(), MAX_HISTORY);
    }
}
