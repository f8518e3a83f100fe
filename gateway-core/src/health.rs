//! Per-credential sliding-window health score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Derived, persisted health state for a single credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Successes observed in the current window.
    pub success_count: u64,
    /// Failures observed in the current window.
    pub failure_count: u64,
    /// When the current window started.
    pub window_start: DateTime<Utc>,
    /// When this snapshot was last touched.
    pub last_updated: DateTime<Utc>,
}

impl HealthSnapshot {
    /// A fresh snapshot with an empty window starting now.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            window_start: now,
            last_updated: now,
        }
    }

    /// `success / (success + failure)`, clamped to `[0, 1]`; `1.0` when the
    /// window has seen no traffic yet.
    #[must_use]
    pub fn score(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            (self.success_count as f64 / total as f64).clamp(0.0, 1.0)
        }
    }
}

/// Configuration for the sliding window.
#[derive(Debug, Clone, Copy)]
pub struct HealthTrackerConfig {
    /// Window length. Default 300s.
    pub window: Duration,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
        }
    }
}

/// Stateless operations over a [`HealthSnapshot`], parameterized by
/// [`HealthTrackerConfig`]. The snapshot itself is owned by the pool; this
/// type only knows how to advance it.
#[derive(Debug, Clone, Copy)]
pub struct HealthTracker {
    config: HealthTrackerConfig,
}

impl HealthTracker {
    /// Build a tracker for the given window configuration.
    #[must_use]
    pub fn new(config: HealthTrackerConfig) -> Self {
        Self { config }
    }

    /// Roll the window if it has expired, then record a success.
    pub fn record_success(&self, snapshot: &mut HealthSnapshot, now: DateTime<Utc>) {
        self.roll_window(snapshot, now);
        snapshot.success_count += 1;
        snapshot.last_updated = now;
    }

    /// Roll the window if it has expired, then record a failure.
    pub fn record_failure(&self, snapshot: &mut HealthSnapshot, now: DateTime<Utc>) {
        self.roll_window(snapshot, now);
        snapshot.failure_count += 1;
        snapshot.last_updated = now;
    }

    /// Reset the window to empty, starting at `now`, if the current window
    /// has run at least [`HealthTrackerConfig::window`] long. No decay
    /// within a window: this is an atomic reset, not a leak.
    fn roll_window(&self, snapshot: &mut HealthSnapshot, now: DateTime<Utc>) {
        let elapsed = now
            .signed_duration_since(snapshot.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.config.window {
            snapshot.success_count = 0;
            snapshot.failure_count = 0;
            snapshot.window_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_scores_one() {
        let snap = HealthSnapshot::new(Utc::now());
        assert!((snap.score() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_is_ratio_of_success_to_total() {
        let now = Utc::now();
        let mut snap = HealthSnapshot::new(now);
        let tracker = HealthTracker::new(HealthTrackerConfig::default());
        tracker.record_success(&mut snap, now);
        tracker.record_success(&mut snap, now);
        tracker.record_failure(&mut snap, now);
        assert!((snap.score() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn window_resets_after_expiry() {
        let start = Utc::now();
        let mut snap = HealthSnapshot::new(start);
        let tracker = HealthTracker::new(HealthTrackerConfig {
            window: Duration::from_secs(10),
        });
        tracker.record_failure(&mut snap, start);
        assert_eq!(snap.failure_count, 1);

        let later = start + chrono::Duration::seconds(11);
        tracker.record_success(&mut snap, later);
        assert_eq!(snap.failure_count, 0, "window should have rolled");
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.window_start, later);
    }

    #[test]
    fn score_clamped_to_unit_interval() {
        let snap = HealthSnapshot {
            success_count: 3,
            failure_count: 0,
            window_start: Utc::now(),
            last_updated: Utc::now(),
        };
        assert!(snap.score() <= 1.0 && snap.score() >= 0.0);
    }
}
