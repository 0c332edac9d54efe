//! Sensor Monitor Query Service
//!
//! Read-only HTTP surface over the reading store, plus the configuration,
//! logging and lifecycle wiring used by the `sensor-monitor` binary.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

pub mod config;
mod error;
pub mod lifecycle;
pub mod rate_limit;
mod routes;

pub use config::{AppConfig, ConfigError, LogFormat};
pub use error::ApiError;
pub use lifecycle::{Lifecycle, LifecycleError, ShutdownReason};

use ingest::IngestMonitor;
use storage::ReadingStore;

/// Application state shared across handlers
pub struct AppState {
    /// Shared store handle; handlers only read
    pub store: ReadingStore,
    /// Subscriber state and counters
    pub ingest: IngestMonitor,
    pub version: String,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    /// Sensors silent for longer than this are reported stale
    pub freshness_window: Duration,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: ReadingStore, ingest: IngestMonitor, freshness_window: Duration) -> Self {
        Self {
            store,
            ingest,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
            started_at: Utc::now(),
            freshness_window,
            metrics: None,
        }
    }

    /// Serve `/metrics` from this recorder handle
    pub fn with_metrics(mut self, metrics: Option<PrometheusHandle>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentStatus,
}

/// Component status
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub database: ComponentHealth,
    pub mqtt: ComponentHealth,
}

/// Individual component health
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: String,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/system/status", get(routes::system::get_status))
        .route("/api/sensors", get(routes::sensors::get_all_latest))
        .route("/api/sensors/:id/latest", get(routes::sensors::get_latest))
        .route("/api/sensors/:id/state", get(routes::sensors::get_state))
        .route("/api/sensors/:id/range", get(routes::sensors::get_range))
        .route("/api/data/latest", get(routes::data::get_latest))
        .route("/api/data/history", get(routes::data::get_history))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness; always 200 while the process serves requests
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = if state.store.is_closed() { "closed" } else { "ok" };

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().timestamp(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        components: ComponentStatus {
            database: ComponentHealth {
                status: database.to_string(),
            },
            mqtt: ComponentHealth {
                status: state.ingest.state().as_str().to_string(),
            },
        },
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

static METRICS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the process-wide Prometheus recorder on first call and return
/// its handle. `None` if another recorder was installed first.
pub fn install_metrics() -> Option<PrometheusHandle> {
    METRICS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .clone()
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Unknown log level: {0}")]
    InvalidLevel(String),
    #[error("Failed to set tracing subscriber: {0}")]
    Init(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize logging
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), LoggingError> {
    let level =
        Level::from_str(level).map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}
