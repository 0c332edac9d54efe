//! System Status Route

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::{ApiError, AppState};
use ingest::{IngestSnapshot, SubscriberState};

/// Aggregate view used by the dashboard overview
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub status: &'static str,
    pub version: String,
    pub server_start_time: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub total_sensors: i64,
    /// Sensors that reported within the freshness window
    pub active_devices: i64,
    pub stale_sensors: i64,
    pub freshness_window_seconds: u64,
    /// Readings timestamped since midnight UTC
    pub today_readings: i64,
    pub total_readings: i64,
    /// Percentage of known sensors that are fresh
    pub data_integrity: f64,
    /// Percentage of readings not flagged suspect
    pub data_quality: f64,
    pub mqtt_status: &'static str,
    pub subscriber_state: SubscriberState,
    pub ingest: IngestSnapshot,
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemStatus>, ApiError> {
    let now = Utc::now();
    let window = chrono::Duration::from_std(state.freshness_window)
        .unwrap_or_else(|_| chrono::Duration::days(36_500));
    let fresh_since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);

    let activity = state.store.sensor_activity(fresh_since).await?;
    let today_readings = state.store.count_since(midnight).await?;
    let totals = state.store.totals().await?;

    let subscriber_state = state.ingest.state();

    Ok(Json(SystemStatus {
        status: "running",
        version: state.version.clone(),
        server_start_time: state.started_at,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        total_sensors: activity.total,
        active_devices: activity.active,
        stale_sensors: activity.total - activity.active,
        freshness_window_seconds: state.freshness_window.as_secs(),
        today_readings,
        total_readings: totals.total,
        data_integrity: percentage(activity.active, activity.total),
        data_quality: percentage(totals.total - totals.suspect, totals.total),
        mqtt_status: if subscriber_state.is_online() {
            "online"
        } else {
            "offline"
        },
        subscriber_state,
        ingest: state.ingest.snapshot(),
    }))
}

/// `part / whole` as a percentage with one decimal; 0 when `whole` is 0
fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    (part as f64 * 1000.0 / whole as f64).round() / 10.0
}
