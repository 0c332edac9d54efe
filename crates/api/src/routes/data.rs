//! Dashboard Data Routes
//!
//! Feed the dashboard's latest-readings table and history charts.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{ApiError, AppState};
use storage::StoredReading;

/// Readings cap for one history request
const MAX_HISTORY_READINGS: usize = 50_000;

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    5
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(alias = "device_id")]
    pub sensor_id: Option<String>,
    #[serde(default = "default_hours")]
    pub hours: u32,
}

fn default_hours() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub status: &'static str,
    pub count: usize,
    pub data: Vec<StoredReading>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub status: &'static str,
    pub sensor_id: String,
    pub hours: u32,
    pub count: usize,
    pub data: Vec<StoredReading>,
}

/// Most recently received readings across all sensors, newest first
pub async fn get_latest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<LatestResponse>, ApiError> {
    let limit = params.limit.clamp(1, 1000);
    let data = state.store.recent(limit).await?;

    Ok(Json(LatestResponse {
        status: "success",
        count: data.len(),
        data,
    }))
}

/// One sensor's readings over the last `hours`, oldest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let sensor_id = params
        .sensor_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("sensor_id is required".into()))?;
    let hours = params.hours.clamp(1, 168);

    let to = Utc::now();
    let from = to - Duration::hours(i64::from(hours));
    let data = state
        .store
        .range(&sensor_id, from, to)
        .collect(MAX_HISTORY_READINGS)
        .await?;

    Ok(Json(HistoryResponse {
        status: "success",
        sensor_id,
        hours,
        count: data.len(),
        data,
    }))
}
