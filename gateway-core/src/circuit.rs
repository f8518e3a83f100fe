//! Three-state circuit breaker guarding a single credential.
//!
//! Two edge cases are wired in explicitly: only a successful HALF_OPEN probe
//! closes the circuit and clears the failure streak, and a CLOSED success
//! never resets `consecutive_failures` on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The three states a breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without contacting the upstream.
    Open,
    /// A single probe request is allowed through to test recovery.
    HalfOpen,
}

/// Persisted breaker state for one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed since the last success while CLOSED.
    pub consecutive_failures: u32,
    /// Timestamp of the most recent recorded failure, if any.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last transitioned to OPEN. Non-null iff
    /// `state` is OPEN or HALF_OPEN.
    pub opened_at: Option<DateTime<Utc>>,
    /// Whether a HALF_OPEN probe is currently in flight. Guards against two
    /// concurrent probes racing for the same credential.
    pub probe_in_flight: bool,
}

impl CircuitSnapshot {
    /// A fresh breaker in the CLOSED state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Thresholds governing a [`CircuitSnapshot`]'s transitions.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// How long the breaker stays OPEN before allowing a HALF_OPEN probe.
    pub open_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(60),
        }
    }
}

/// Whether a caller may currently route a request through this credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed normally.
    Allowed,
    /// Request may proceed, but it is the single HALF_OPEN probe; callers
    /// must report its outcome via [`CircuitBreaker::on_probe_result`].
    Probe,
    /// Request must be rejected; the breaker is OPEN and not yet eligible
    /// for a probe.
    Rejected,
}

/// Stateless state-machine operations over a [`CircuitSnapshot`].
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Build a breaker for the given thresholds.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    /// Preview the [`Admission`] a request against this credential would
    /// receive right now, without claiming a probe slot or advancing
    /// OPEN -> HALF_OPEN. Safe to call across many candidates while
    /// surveying eligibility, before committing to one via [`Self::admit`].
    #[must_use]
    pub fn would_admit(&self, snapshot: &CircuitSnapshot, now: DateTime<Utc>) -> Admission {
        match snapshot.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if snapshot.probe_in_flight {
                    Admission::Rejected
                } else {
                    Admission::Probe
                }
            }
            CircuitState::Open => {
                let elapsed = snapshot
                    .opened_at
                    .map(|opened| now.signed_duration_since(opened))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_cooldown {
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Decide whether a request against this credential may proceed right
    /// now, advancing OPEN -> HALF_OPEN and claiming the probe slot if the
    /// outcome is [`Admission::Probe`]. Callers surveying many candidates
    /// should use [`Self::would_admit`] instead and call this only for the
    /// one credential actually selected, so an unselected probe-eligible
    /// credential is not left claimed.
    pub fn admit(&self, snapshot: &mut CircuitSnapshot, now: DateTime<Utc>) -> Admission {
        let admission = self.would_admit(snapshot, now);
        if admission == Admission::Probe {
            snapshot.state = CircuitState::HalfOpen;
            snapshot.probe_in_flight = true;
        }
        admission
    }

    /// Record a successful response while CLOSED.
    ///
    /// Deliberately a no-op on `consecutive_failures`: the counter is not
    /// reset by a CLOSED success, only by a successful HALF_OPEN probe (see
    /// [`Self::on_probe_result`]). A credential that fails, succeeds once,
    /// then fails again still counts all three failures toward the same
    /// streak once it crosses back under threshold-tracking, matching the
    /// observed source behavior this breaker is modeled on.
    pub fn record_success(&self, _snapshot: &mut CircuitSnapshot) {}

    /// Record a failed response while CLOSED, tripping to OPEN once
    /// `consecutive_failures` reaches the threshold.
    pub fn record_failure(&self, snapshot: &mut CircuitSnapshot, now: DateTime<Utc>) {
        if snapshot.state != CircuitState::Closed {
            return;
        }
        snapshot.last_failure_at = Some(now);
        snapshot.consecutive_failures += 1;
        if snapshot.consecutive_failures >= self.config.failure_threshold {
            snapshot.state = CircuitState::Open;
            snapshot.opened_at = Some(now);
        }
    }

    /// Record a rate-limit response (HTTP 429) while CLOSED: trips the
    /// breaker open immediately, bypassing the failure threshold. See
    /// [`crate::error::UpstreamError::is_rate_limit`].
    pub fn record_rate_limited(&self, snapshot: &mut CircuitSnapshot, now: DateTime<Utc>) {
        if snapshot.state != CircuitState::Closed {
            return;
        }
        snapshot.last_failure_at = Some(now);
        snapshot.consecutive_failures += 1;
        snapshot.state = CircuitState::Open;
        snapshot.opened_at = Some(now);
    }

    /// Report the outcome of a HALF_OPEN probe obtained via
    /// [`Self::admit`]. Success closes the breaker and clears the failure
    /// count; failure reopens it and restarts the cooldown clock.
    pub fn on_probe_result(&self, snapshot: &mut CircuitSnapshot, success: bool, now: DateTime<Utc>) {
        snapshot.probe_in_flight = false;
        if success {
            snapshot.state = CircuitState::Closed;
            snapshot.consecutive_failures = 0;
            snapshot.opened_at = None;
        } else {
            snapshot.last_failure_at = Some(now);
            snapshot.state = CircuitState::Open;
            snapshot.opened_at = Some(now);
        }
    }

    /// Timestamp after which a HALF_OPEN probe becomes eligible, derived
    /// from `opened_at + open_cooldown`. `None` unless `state` is OPEN or
    /// HALF_OPEN, matching the data model's `next-attempt` invariant.
    #[must_use]
    pub fn next_attempt(&self, snapshot: &CircuitSnapshot) -> Option<DateTime<Utc>> {
        match snapshot.state {
            CircuitState::Open | CircuitState::HalfOpen => snapshot
                .opened_at
                .map(|opened| opened + chrono::Duration::from_std(self.config.open_cooldown).unwrap_or_default()),
            CircuitState::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            open_cooldown: Duration::from_secs(30),
        }
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        let now = Utc::now();
        breaker.record_failure(&mut snap, now);
        breaker.record_failure(&mut snap, now);
        assert_eq!(snap.state, CircuitState::Closed);
        breaker.record_failure(&mut snap, now);
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.opened_at, Some(now));
    }

    #[test]
    fn rejects_while_open_before_cooldown() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        let now = Utc::now();
        snap.state = CircuitState::Open;
        snap.opened_at = Some(now);
        let admission = breaker.admit(&mut snap, now + chrono::Duration::seconds(5));
        assert_eq!(admission, Admission::Rejected);
    }

    #[test]
    fn probes_after_cooldown_and_allows_only_one_at_a_time() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        let opened = Utc::now();
        snap.state = CircuitState::Open;
        snap.opened_at = Some(opened);
        let later = opened + chrono::Duration::seconds(31);

        let first = breaker.admit(&mut snap, later);
        assert_eq!(first, Admission::Probe);
        assert_eq!(snap.state, CircuitState::HalfOpen);

        let second = breaker.admit(&mut snap, later);
        assert_eq!(second, Admission::Rejected, "only one probe in flight");
    }

    #[test]
    fn successful_probe_closes_and_resets() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        snap.state = CircuitState::HalfOpen;
        snap.probe_in_flight = true;
        snap.consecutive_failures = 3;
        breaker.on_probe_result(&mut snap, true, Utc::now());
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(!snap.probe_in_flight);
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        snap.state = CircuitState::HalfOpen;
        snap.probe_in_flight = true;
        let now = Utc::now();
        breaker.on_probe_result(&mut snap, false, now);
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.opened_at, Some(now));
    }

    #[test]
    fn closed_success_does_not_reset_failure_streak() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        let now = Utc::now();
        breaker.record_failure(&mut snap, now);
        assert_eq!(snap.consecutive_failures, 1);
        breaker.record_success(&mut snap);
        assert_eq!(
            snap.consecutive_failures, 1,
            "CLOSED success must not clear the streak"
        );
        breaker.record_failure(&mut snap, now);
        breaker.record_failure(&mut snap, now);
        assert_eq!(snap.state, CircuitState::Open, "streak survives the interleaved success");
    }

    #[test]
    fn rate_limit_trips_open_immediately_below_threshold() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        let now = Utc::now();
        breaker.record_rate_limited(&mut snap, now);
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.consecutive_failures, 1, "threshold is 3, rate limit bypasses it");
    }

    #[test]
    fn next_attempt_only_set_while_open_or_half_open() {
        let breaker = CircuitBreaker::new(cfg());
        let mut snap = CircuitSnapshot::new();
        assert_eq!(breaker.next_attempt(&snap), None);

        let now = Utc::now();
        breaker.record_rate_limited(&mut snap, now);
        let expected = now + chrono::Duration::seconds(30);
        assert_eq!(breaker.next_attempt(&snap), Some(expected));
    }
}
