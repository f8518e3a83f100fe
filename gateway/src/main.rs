//! OpenAI-compatible reverse-proxy gateway: binds the axum HTTP surface
//! over `gateway-core`'s credential pool, circuit breaker, and resilient
//! persistence.

mod auth;
mod errors;
mod handlers;
mod state;
mod telemetry;

use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use gateway_core::{config, ConfigWatcher, DocumentStore, KeyManager, ResilientStore, SqliteStore, UpstreamClient};
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let watcher = ConfigWatcher::new(config::policy_path(None), config::keys_path(None))?;
    let gateway_config = watcher.current();
    let proxy = gateway_config.policy.proxy.clone();

    let primary = SqliteStore::open(&gateway_config.policy.persistence.primary_path)?;
    let fallback = DocumentStore::new(gateway_config.policy.persistence.fallback_path.clone());
    let store = Arc::new(ResilientStore::new(primary, fallback));
    let snapshot = store.load().await?;

    let keys = Arc::new(KeyManager::bootstrap(
        &gateway_config.credentials.keys,
        snapshot.credentials,
        &gateway_config.policy.monitoring,
        store,
    ));

    let upstream = Arc::new(UpstreamClient::new(proxy.upstream_base_url.clone(), proxy.request_timeout())?);
    let watcher = Arc::new(watcher);

    let app_state = AppState {
        keys: keys.clone(),
        upstream,
        config: watcher.clone(),
        started_at: Instant::now(),
        request_metrics: Arc::new(telemetry::RequestMetrics::default()),
    };

    spawn_reconcile_poller(watcher.clone(), keys);

    let admin_routes = Router::new()
        .route("/health", get(handlers::admin::health))
        .route("/keys", get(handlers::admin::list_keys))
        .route("/keys/:id/enable", post(handlers::admin::enable_key))
        .route("/keys/:id/disable", post(handlers::admin::disable_key))
        .route("/metrics", get(handlers::admin::metrics))
        .route("/config/reload", post(handlers::admin::reload_config));

    let max_body = gateway_config.policy.proxy.max_payload_size_bytes;
    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat::chat_completions))
        .route("/v1/models", get(handlers::models::list_models))
        .route("/v1/models/:id", get(handlers::models::get_model))
        .route("/v1/embeddings", post(handlers::passthrough::embeddings))
        .route("/v1/images/generations", post(handlers::passthrough::image_generations))
        .route("/healthz", get(handlers::admin::healthz))
        .nest("/admin", admin_routes)
        .fallback(errors::not_found)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(middleware::from_fn(telemetry::request_id_middleware))
        .layer(middleware::from_fn_with_state(app_state.clone(), telemetry::request_metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let path = request.extensions().get::<MatchedPath>().map_or_else(|| request.uri().path(), MatchedPath::as_str);
                tracing::info_span!("http_request", method = %request.method(), path)
            }),
        )
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", proxy.host, proxy.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("gateway listening on {addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Background bridge between the hot-reloadable config view and the
/// credential pool: `ConfigWatcher` has no subscriber mechanism of its own,
/// so this polls the merged view and reconciles on change.
fn spawn_reconcile_poller(watcher: Arc<ConfigWatcher>, keys: Arc<KeyManager>) {
    tokio::spawn(async move {
        let mut last = watcher.current();
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            let current = watcher.current();
            if current.credentials != last.credentials {
                let counts = keys.reconcile(&current.credentials.keys);
                tracing::info!(added = counts.added, removed = counts.removed, updated = counts.updated, "reconciled credential pool");
            }
            if current.policy.monitoring != last.policy.monitoring {
                keys.update_monitoring_config(&current.policy.monitoring);
                tracing::info!("applied updated monitoring policy");
            }
            last = current;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
