//! Config Source: the two declarative documents (policy, credentials),
//! their on-disk discovery, and hot-reload via filesystem watching, backed
//! by a `parking_lot::RwLock`-shared view and a `notify` filesystem watcher.

use crate::credential::CredentialConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// `proxy` section of the policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyPolicy {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted request body size, in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_size_bytes: usize,
    /// Optional bearer token required on `/admin/*` routes.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Per-request upstream timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Base URL of the upstream provider.
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    /// Bearer tokens accepted from clients on the public surface.
    #[serde(default)]
    pub access_tokens: Vec<String>,
    /// Whether the public surface requires a matching access token.
    #[serde(default)]
    pub require_auth: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_payload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_upstream_base_url() -> String {
    String::new()
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_size_bytes: default_max_payload_bytes(),
            admin_token: None,
            request_timeout_ms: default_timeout_ms(),
            upstream_base_url: default_upstream_base_url(),
            access_tokens: Vec::new(),
            require_auth: false,
        }
    }
}

impl ProxyPolicy {
    /// The configured timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// `monitoring` section of the policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringPolicy {
    /// Health-tracker window length, in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Consecutive failures required to trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Breaker recovery time before a HALF_OPEN probe, in seconds.
    #[serde(default = "default_recovery_time_seconds")]
    pub recovery_time_seconds: u64,
}

fn default_window_seconds() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_time_seconds() -> u64 {
    60
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            failure_threshold: default_failure_threshold(),
            recovery_time_seconds: default_recovery_time_seconds(),
        }
    }
}

/// `persistence` section of the policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistencePolicy {
    /// Path to the primary (SQLite) store file.
    #[serde(default = "default_primary_path")]
    pub primary_path: PathBuf,
    /// Path to the fallback (JSON document) store file.
    #[serde(default = "default_fallback_path")]
    pub fallback_path: PathBuf,
}

fn default_primary_path() -> PathBuf {
    PathBuf::from("gateway-state.sqlite3")
}

fn default_fallback_path() -> PathBuf {
    PathBuf::from("gateway-state.json")
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            primary_path: default_primary_path(),
            fallback_path: default_fallback_path(),
        }
    }
}

/// The full policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    /// Proxy-facing settings.
    #[serde(default)]
    pub proxy: ProxyPolicy,
    /// Credential-pool monitoring settings.
    #[serde(default)]
    pub monitoring: MonitoringPolicy,
    /// Storage paths.
    #[serde(default)]
    pub persistence: PersistencePolicy,
}

/// The full credential document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialDocument {
    /// Configured credentials.
    #[serde(default)]
    pub keys: Vec<CredentialConfig>,
}

/// The merged, currently-active configuration view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    /// Merged policy document.
    pub policy: PolicyDocument,
    /// Merged credential document.
    pub credentials: CredentialDocument,
}

/// Resolve the on-disk path for one of the two documents.
///
/// Discovery priority: explicit path argument > environment variable >
/// `./<default>` in the current working directory.
fn resolve_path(explicit: Option<&Path>, env_var: &str, default_name: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(from_env) = std::env::var(env_var) {
        return PathBuf::from(from_env);
    }
    PathBuf::from(default_name)
}

/// Resolve the policy document path.
#[must_use]
pub fn policy_path(explicit: Option<&Path>) -> PathBuf {
    resolve_path(explicit, "GATEWAY_POLICY_PATH", "policy.json")
}

/// Resolve the credential document path.
#[must_use]
pub fn keys_path(explicit: Option<&Path>) -> PathBuf {
    resolve_path(explicit, "GATEWAY_KEYS_PATH", "keys.json")
}

/// Read and parse the policy document. A missing file yields defaults; a
/// malformed file is an error the caller is expected to log and ignore,
/// retaining the prior valid view.
///
/// The admin token and upstream base URL recognise an environment override
/// (`GATEWAY_ADMIN_TOKEN`, `GATEWAY_UPSTREAM_BASE_URL`), applied after
/// parsing so it takes precedence over the on-disk document regardless of
/// which field the file itself sets.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_policy(path: &Path) -> Result<PolicyDocument, ConfigError> {
    let mut doc = if !path.exists() {
        PolicyDocument::default()
    } else {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?
    };
    apply_env_overrides(&mut doc.proxy);
    Ok(doc)
}

/// Layer the recognised environment overrides onto an already-parsed
/// [`ProxyPolicy`], in place.
fn apply_env_overrides(proxy: &mut ProxyPolicy) {
    if let Ok(token) = std::env::var("GATEWAY_ADMIN_TOKEN") {
        proxy.admin_token = Some(token);
    }
    if let Ok(base_url) = std::env::var("GATEWAY_UPSTREAM_BASE_URL") {
        proxy.upstream_base_url = base_url;
    }
}

/// Read and parse the credential document, with the same missing/malformed
/// semantics as [`load_policy`].
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_credentials(path: &Path) -> Result<CredentialDocument, ConfigError> {
    if !path.exists() {
        return Ok(CredentialDocument::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
}

/// Failure modes for reading a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {0:?}: {1}")]
    Io(PathBuf, String),
    /// The file's contents did not parse as the expected document shape.
    #[error("failed to parse {0:?}: {1}")]
    Parse(PathBuf, String),
}

/// Shared, hot-reloadable configuration handle.
///
/// Watches both documents' parent directories (atomic-rename editors
/// replace the whole file, so the directory must be watched, not just the
/// file) and republishes a merged [`GatewayConfig`] into the shared
/// `RwLock` on every filesystem event. Parse errors during a reload are
/// logged and the previous valid view is retained: callers never observe
/// a torn or default config after a successful initial load.
pub struct ConfigWatcher {
    current: Arc<RwLock<GatewayConfig>>,
    policy_path: PathBuf,
    keys_path: PathBuf,
    _watcher: notify::RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("policy_path", &self.policy_path)
            .field("keys_path", &self.keys_path)
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// Build a watcher rooted at the given document paths, performing an
    /// initial synchronous load.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying OS file watcher cannot be
    /// installed. Malformed documents do not error here; they fall back to
    /// defaults for the initial load, consistent with [`load_policy`].
    pub fn new(policy_path: PathBuf, keys_path: PathBuf) -> Result<Self, notify::Error> {
        let initial = GatewayConfig {
            policy: load_policy(&policy_path).unwrap_or_default(),
            credentials: load_credentials(&keys_path).unwrap_or_default(),
        };
        let current = Arc::new(RwLock::new(initial));

        let watched_current = current.clone();
        let watched_policy_path = policy_path.clone();
        let watched_keys_path = keys_path.clone();

        use notify::{Event, RecursiveMode, Watcher};
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                reload_if_touched(&watched_current, &watched_policy_path, &watched_keys_path, &event);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "config watcher error");
            }
        })?;

        for path in [&policy_path, &keys_path] {
            let watch_target = watch_root(path);
            watcher.watch(&watch_target, RecursiveMode::NonRecursive)?;
        }

        Ok(Self {
            current,
            policy_path,
            keys_path,
            _watcher: watcher,
        })
    }

    /// The current merged view. Cloned out from under the lock so callers
    /// never hold it across an await point.
    #[must_use]
    pub fn current(&self) -> GatewayConfig {
        self.current.read().clone()
    }

    /// The shared handle, for components (e.g. the Key Manager) that need
    /// to observe updates rather than poll.
    #[must_use]
    pub fn shared(&self) -> Arc<RwLock<GatewayConfig>> {
        self.current.clone()
    }

    /// Synchronously re-read both documents and publish. Used for manual
    /// reload (e.g. the admin `/admin/reload` route) as well as internally
    /// by the filesystem watcher.
    ///
    /// # Errors
    ///
    /// Returns an error, and leaves the current view untouched, if either
    /// document exists but fails to parse.
    pub fn force_reload(&self) -> Result<(), ConfigError> {
        let policy = load_policy(&self.policy_path)?;
        let credentials = load_credentials(&self.keys_path)?;
        *self.current.write() = GatewayConfig { policy, credentials };
        Ok(())
    }
}

fn watch_root(path: &Path) -> PathBuf {
    if path.exists() {
        path.to_path_buf()
    } else {
        path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

/// Re-read and publish if the event touches one of our two paths.
///
/// Filesystem watchers fire repeatedly for a single logical save (separate
/// directory and file events, and editors that write-then-rename produce
/// more than one event): this function is idempotent under repeated calls
/// with the same settled file contents, so callers need not deduplicate.
fn reload_if_touched(current: &Arc<RwLock<GatewayConfig>>, policy_path: &Path, keys_path: &Path, event: &notify::Event) {
    let touches_policy = event.paths.iter().any(|p| p == policy_path);
    let touches_keys = event.paths.iter().any(|p| p == keys_path);
    if !touches_policy && !touches_keys {
        return;
    }

    let policy = match load_policy(policy_path) {
        Ok(policy) => policy,
        Err(err) => {
            tracing::warn!(error = %err, "failed to reload policy document, keeping prior view");
            current.read().policy.clone()
        }
    };
    let credentials = match load_credentials(keys_path) {
        Ok(credentials) => credentials,
        Err(err) => {
            tracing::warn!(error = %err, "failed to reload credential document, keeping prior view");
            current.read().credentials.clone()
        }
    };
    *current.write() = GatewayConfig { policy, credentials };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let policy = load_policy(&dir.path().join("nope.json")).unwrap();
        assert_eq!(policy, PolicyDocument::default());
    }

    #[test]
    fn malformed_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(load_policy(&path).is_err());
    }

    #[test]
    fn resolves_explicit_then_env_then_default() {
        let explicit = PathBuf::from("/explicit/policy.json");
        assert_eq!(policy_path(Some(&explicit)), explicit);
    }

    #[test]
    fn force_reload_picks_up_written_changes() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let keys_path = dir.path().join("keys.json");
        std::fs::write(&policy_path, br#"{"proxy":{"port":9999}}"#).unwrap();

        let watcher = ConfigWatcher::new(policy_path.clone(), keys_path).unwrap();
        assert_eq!(watcher.current().policy.proxy.port, 9999);

        let mut file = std::fs::OpenOptions::new().write(true).open(&policy_path).unwrap();
        file.write_all(br#"{"proxy":{"port":8888}}"#).unwrap();
        drop(file);

        watcher.force_reload().unwrap();
        assert_eq!(watcher.current().policy.proxy.port, 8888);
    }

    #[test]
    fn repeated_reload_events_for_the_same_save_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let keys_path = dir.path().join("keys.json");
        std::fs::write(&policy_path, br#"{"proxy":{"port":7777}}"#).unwrap();

        let current = Arc::new(RwLock::new(GatewayConfig::default()));
        let event = notify::Event::new(notify::EventKind::Modify(notify::event::ModifyKind::Any)).add_path(policy_path.clone());

        // Editors that write-then-rename, and watchers on some platforms,
        // fire more than one event per logical save; applying the same
        // settled file twice must not change the outcome.
        reload_if_touched(&current, &policy_path, &keys_path, &event);
        reload_if_touched(&current, &policy_path, &keys_path, &event);

        assert_eq!(current.read().policy.proxy.port, 7777);
    }

    #[test]
    fn admin_token_and_upstream_base_url_env_overrides_win_over_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, br#"{"proxy":{"admin_token":"from-file","upstream_base_url":"https://from-file.example"}}"#).unwrap();

        std::env::set_var("GATEWAY_ADMIN_TOKEN", "from-env");
        std::env::set_var("GATEWAY_UPSTREAM_BASE_URL", "https://from-env.example");
        let policy = load_policy(&path).unwrap();
        std::env::remove_var("GATEWAY_ADMIN_TOKEN");
        std::env::remove_var("GATEWAY_UPSTREAM_BASE_URL");

        assert_eq!(policy.proxy.admin_token.as_deref(), Some("from-env"));
        assert_eq!(policy.proxy.upstream_base_url, "https://from-env.example");
    }
}
