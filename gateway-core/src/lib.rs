#![doc(html_root_url = "https://docs.rs/gateway-core/latest/gateway_core/")]

//! Core building blocks for an OpenAI-compatible reverse-proxy gateway:
//! a managed pool of upstream credentials, per-credential health and
//! circuit-breaker tracking, hot-reloadable configuration, resilient
//! persistence with primary/fallback failover, and the upstream HTTP
//! client.
//!
//! This crate owns no HTTP listener of its own; the `gateway` binary
//! wires these pieces to an axum router.

pub mod circuit;
pub mod config;
pub mod credential;
pub mod error;
pub mod health;
pub mod markers;
pub mod metrics;
pub mod pool;
pub mod selector;
pub mod store;
pub mod upstream;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use config::{ConfigError, ConfigWatcher, GatewayConfig, MonitoringPolicy, PersistencePolicy, ProxyPolicy};
pub use credential::{CredentialConfig, CredentialRecord};
pub use error::{GatewayError, UpstreamError};
pub use health::{HealthSnapshot, HealthTracker, HealthTrackerConfig};
pub use markers::{substitute_buffered, MarkerFilter};
pub use metrics::{CredentialGauges, MetricsLog, Outcome, RequestMetric};
pub use pool::{DerivedStatus, KeyManager, KeySummary, PoolCounts, PoolHealth, ReconcileCounts};
pub use selector::Candidate;
pub use store::document::DocumentStore;
pub use store::resilient::ResilientStore;
pub use store::sqlite::SqliteStore;
pub use store::{CredentialEntry, PoolSnapshot, StoreError, UsageStats, UsageWindow};
pub use upstream::{
    translate_model, translate_model_list, AuthHeader, BufferedResponse, ModelCatalog, ModelMetadata, TranslatedModel, UpstreamClient,
};
