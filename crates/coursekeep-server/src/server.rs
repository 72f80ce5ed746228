use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use coursekeep_engine::TrackingService;
use coursekeep_settings::ServerSettings;
use coursekeep_telemetry::SqliteLogSink;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_body_bytes: settings.max_body_bytes,
            request_timeout_secs: settings.request_timeout_secs,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TrackingService>,
    /// Present when warn+ logs are persisted.
    pub log_sink: Option<Arc<SqliteLogSink>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<TrackingService>, log_sink: Option<Arc<SqliteLogSink>>) -> Self {
        Self {
            service,
            log_sink,
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/sessions", post(handlers::initialize))
        .route("/sessions/{id}", get(handlers::load_session))
        .route("/sessions/{id}/commit", post(handlers::commit))
        .route("/sessions/{id}/terminate", post(handlers::terminate))
        .route(
            "/sessions/{id}/value",
            get(handlers::get_value).put(handlers::set_value),
        )
        .route(
            "/packages/{id}/sessions",
            get(handlers::package_sessions).delete(handlers::delete_package_sessions),
        )
        .route("/sync/upload", post(handlers::upload))
        .route("/sync/status", get(handlers::sync_status))
        .route("/sync/trigger", post(handlers::sync_trigger))
        .route("/sync/start", post(handlers::sync_start))
        .route("/sync/stop", post(handlers::sync_stop))
        .route("/sync/exhausted", get(handlers::sync_exhausted))
        .route("/sync/entries/{id}/retry", post(handlers::retry_entry))
        .route("/sync/entries/{id}/exhaustions", get(handlers::entry_exhaustions))
        .route("/logs", get(handlers::logs));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle to shut the server down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state, &config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "coursekeep server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("coursekeep server stopped");
    }
}
