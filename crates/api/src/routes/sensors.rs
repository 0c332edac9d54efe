//! Sensor Routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{ApiError, AppState};
use storage::{SensorState, StoredReading};
use telemetry::{parse_timestamp, SensorReading};

/// Readings returned by a range query unless `limit` says otherwise
const DEFAULT_RANGE_LIMIT: usize = 10_000;
/// Hard cap on a single range response
const MAX_RANGE_LIMIT: usize = 50_000;
/// Window used when `from` is omitted
const DEFAULT_RANGE_HOURS: i64 = 24;

/// Query parameters for the range endpoint
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    /// Window start, RFC 3339 or Unix epoch
    pub from: Option<String>,
    /// Window end, RFC 3339 or Unix epoch
    pub to: Option<String>,
    pub limit: Option<usize>,
}

/// Response for the range endpoint
#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub sensor_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub count: usize,
    pub data: Vec<StoredReading>,
}

/// Latest reading of every sensor
pub async fn get_all_latest(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, SensorReading>>, ApiError> {
    Ok(Json(state.store.all_latest().await?))
}

/// Latest accepted reading for one sensor
pub async fn get_latest(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<SensorReading>, ApiError> {
    match state.store.latest(&sensor_id).await? {
        Some(reading) => Ok(Json(reading)),
        None => Err(ApiError::NotFound(sensor_id)),
    }
}

/// Derived state (latest reading and count) for one sensor
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<SensorState>, ApiError> {
    match state.store.sensor_state(&sensor_id).await? {
        Some(sensor_state) => Ok(Json(sensor_state)),
        None => Err(ApiError::NotFound(sensor_id)),
    }
}

/// Readings in `[from, to]`, oldest first
pub async fn get_range(
    State(state): State<Arc<AppState>>,
    Path(sensor_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<RangeResponse>, ApiError> {
    let to = match params.to.as_deref() {
        Some(text) => parse_bound("to", text)?,
        None => Utc::now(),
    };
    let from = match params.from.as_deref() {
        Some(text) => parse_bound("from", text)?,
        None => to - Duration::hours(DEFAULT_RANGE_HOURS),
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RANGE_LIMIT)
        .min(MAX_RANGE_LIMIT);

    let data = state.store.range(&sensor_id, from, to).collect(limit).await?;

    Ok(Json(RangeResponse {
        sensor_id,
        from,
        to,
        count: data.len(),
        data,
    }))
}

fn parse_bound(name: &str, text: &str) -> Result<DateTime<Utc>, ApiError> {
    parse_timestamp(text)
        .ok_or_else(|| ApiError::BadRequest(format!("cannot parse '{}' as a timestamp: {}", name, text)))
}
