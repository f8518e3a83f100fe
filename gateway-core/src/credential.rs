//! Credential records: the stable, mostly-static half of a pool entry.
//!
//! Health and circuit state live alongside a `CredentialRecord` in
//! [`crate::pool::KeyState`]; this module only owns the configured shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One configured upstream credential.
///
/// `id` is the stable display name from the credential document, not a
/// generated identifier, so that reconciliation across hot reloads and
/// restarts can match records by name.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Stable display name, unique within the pool.
    pub id: String,
    /// The secret value sent upstream. Never logged; see the custom `Debug` impl.
    pub secret: String,
    /// Selection weight. Must be `>= 1`.
    pub weight: u32,
    /// Administrative override; `false` means the key is disabled regardless
    /// of circuit/health state.
    pub active: bool,
    /// When this record was first created in the pool.
    pub created_at: DateTime<Utc>,
    /// When this credential was last selected and used for a request.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Cooldown enforced after use, for proactive rate-limit compliance.
    pub cooldown: Duration,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("secret", &"<REDACTED>")
            .field("weight", &self.weight)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl CredentialRecord {
    /// Create a new record with defaults matching a freshly-configured key:
    /// active, no prior usage, created now.
    #[must_use]
    pub fn new(id: String, secret: String, weight: u32, cooldown: Duration) -> Self {
        Self {
            id,
            secret,
            weight: weight.max(1),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
            cooldown,
        }
    }

    /// Whether this credential is still within its post-use cooldown window.
    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_used_at {
            Some(last) if self.cooldown > Duration::ZERO => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().unwrap_or(Duration::ZERO) < self.cooldown
            }
            _ => false,
        }
    }
}

/// A single configured credential entry as read from the credential document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Stable display name.
    pub name: String,
    /// The secret value.
    pub key: String,
    /// Selection weight; defaults to 1 when absent.
    #[serde(default)]
    pub weight: Option<u32>,
    /// Cooldown in seconds; defaults to 0 when absent.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

impl CredentialConfig {
    /// Resolved weight, defaulting to 1.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }

    /// Resolved cooldown, defaulting to zero.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds.unwrap_or(0))
    }
}
