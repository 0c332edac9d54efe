//! Reading Store Implementation

use crate::retry::RetryPolicy;
use crate::schema;
use crate::writer::StoreWriter;
use crate::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, SqlitePool};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{Metric, Quality, SensorReading};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info};

/// Rows fetched per round trip by [`RangeCursor`]
const RANGE_PAGE_SIZE: i64 = 256;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Pool size shared by queries and the writer
    pub max_connections: u32,
    /// How long SQLite waits on a lock before reporting busy
    pub busy_timeout: Duration,
    /// Retry budget for appends
    pub retry: RetryPolicy,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// A reading together with its arrival sequence number
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub seq: i64,
    #[serde(flatten)]
    pub reading: SensorReading,
}

/// Derived per-sensor state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub sensor_id: String,
    pub last_reading: SensorReading,
    pub last_seq: i64,
    pub reading_count: i64,
}

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Sequence number assigned to the new row
    pub seq: i64,
    /// Whether the sensor's latest reading moved to this one
    pub state_advanced: bool,
}

/// Sensor counts relative to a freshness cut-off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorActivity {
    pub total: i64,
    pub active: i64,
}

/// Whole-store reading counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadingTotals {
    pub total: i64,
    pub suspect: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct ReadingRow {
    seq: i64,
    sensor_id: String,
    metric: String,
    value: f64,
    timestamp_ms: i64,
    quality: Option<String>,
}

impl TryFrom<ReadingRow> for StoredReading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        let timestamp = from_millis(row.timestamp_ms)?;
        let quality = match row.quality.as_deref() {
            None => None,
            Some(flag) => Some(
                Quality::parse(flag)
                    .ok_or_else(|| StoreError::InvalidRow(format!("unknown quality {flag:?}")))?,
            ),
        };
        Ok(StoredReading {
            seq: row.seq,
            reading: SensorReading {
                sensor_id: row.sensor_id,
                metric: Metric::from_canonical(row.metric),
                value: row.value,
                timestamp,
                quality,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct StateRow {
    last_seq: i64,
    sensor_id: String,
    metric: String,
    value: f64,
    timestamp_ms: i64,
    quality: Option<String>,
    reading_count: i64,
}

impl TryFrom<StateRow> for SensorState {
    type Error = StoreError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        let reading_count = row.reading_count;
        let stored = StoredReading::try_from(ReadingRow {
            seq: row.last_seq,
            sensor_id: row.sensor_id,
            metric: row.metric,
            value: row.value,
            timestamp_ms: row.timestamp_ms,
            quality: row.quality,
        })?;
        Ok(SensorState {
            sensor_id: stored.reading.sensor_id.clone(),
            last_reading: stored.reading,
            last_seq: stored.seq,
            reading_count,
        })
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp {ms} out of range")))
}

struct StoreInner {
    pool: SqlitePool,
    path: PathBuf,
    retry: RetryPolicy,
    /// One permit; held by the live [`StoreWriter`]
    writer_slot: Arc<Semaphore>,
    closed: AtomicBool,
}

/// Shared handle to the reading database.
///
/// Cloning is cheap and every clone refers to the same pool. Queries may
/// run from any task; appends need the single [`StoreWriter`].
#[derive(Clone)]
pub struct ReadingStore {
    inner: Arc<StoreInner>,
}

impl ReadingStore {
    /// Open (creating if needed) the database and apply the schema
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        info!("Opening reading store at {}", config.path.display());

        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Database(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(2))
            .connect_with(options)
            .await?;

        schema::apply(&pool).await?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                pool,
                path: config.path.clone(),
                retry: config.retry.clone(),
                writer_slot: Arc::new(Semaphore::new(1)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Take the write capability. Fails with [`StoreError::WriterBusy`]
    /// while another writer is alive.
    pub fn writer(&self) -> Result<StoreWriter, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let permit = self
            .inner
            .writer_slot
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => StoreError::WriterBusy,
                TryAcquireError::Closed => StoreError::Closed,
            })?;
        debug!("Store writer acquired");
        Ok(StoreWriter::new(self.clone(), permit))
    }

    /// Latest accepted reading for a sensor
    pub async fn latest(&self, sensor_id: &str) -> Result<Option<SensorReading>, StoreError> {
        Ok(self.sensor_state(sensor_id).await?.map(|s| s.last_reading))
    }

    /// Derived state for a sensor
    pub async fn sensor_state(&self, sensor_id: &str) -> Result<Option<SensorState>, StoreError> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT last_seq, sensor_id, metric, value, timestamp_ms, quality, reading_count \
             FROM sensor_state WHERE sensor_id = ?",
        )
        .bind(sensor_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(SensorState::try_from).transpose()
    }

    /// Latest reading of every known sensor
    pub async fn all_latest(&self) -> Result<BTreeMap<String, SensorReading>, StoreError> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            "SELECT last_seq AS seq, sensor_id, metric, value, timestamp_ms, quality \
             FROM sensor_state ORDER BY sensor_id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let stored = StoredReading::try_from(row)?;
                Ok((stored.reading.sensor_id.clone(), stored.reading))
            })
            .collect()
    }

    /// Readings for a sensor with `from <= timestamp <= to`, ascending by
    /// timestamp then sequence. Nothing is fetched until the cursor is polled.
    pub fn range(&self, sensor_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> RangeCursor {
        RangeCursor {
            pool: self.pool().clone(),
            sensor_id: sensor_id.to_string(),
            from_ms: from.timestamp_millis(),
            to_ms: to.timestamp_millis(),
            after: None,
            page: VecDeque::new(),
            exhausted: from > to,
        }
    }

    /// Newest readings across all sensors, by arrival order
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredReading>, StoreError> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            "SELECT seq, sensor_id, metric, value, timestamp_ms, quality \
             FROM readings ORDER BY seq DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(StoredReading::try_from).collect()
    }

    /// Number of readings with a timestamp at or after `since`
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE timestamp_ms >= ?")
            .bind(since.timestamp_millis())
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Known sensors, and how many have reported at or after `since`
    pub async fn sensor_activity(&self, since: DateTime<Utc>) -> Result<SensorActivity, StoreError> {
        let (total, active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN timestamp_ms >= ? THEN 1 ELSE 0 END), 0) \
             FROM sensor_state",
        )
        .bind(since.timestamp_millis())
        .fetch_one(self.pool())
        .await?;
        Ok(SensorActivity { total, active })
    }

    /// Total and suspect-quality reading counts
    pub async fn totals(&self) -> Result<ReadingTotals, StoreError> {
        let (total, suspect): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN quality IS NOT NULL THEN 1 ELSE 0 END), 0) \
             FROM readings",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(ReadingTotals { total, suspect })
    }

    /// Close the pool. Waits for the live writer, if any, to be dropped
    /// first. Later calls are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Reading store already closed");
            return;
        }

        // Blocks until the writer releases its permit
        if let Ok(permit) = self.inner.writer_slot.acquire().await {
            permit.forget();
        }
        self.inner.writer_slot.close();
        self.inner.pool.close().await;
        info!("Reading store closed ({})", self.inner.path.display());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }
}

/// Lazy, finite cursor over a time window of one sensor's readings.
///
/// Pages are fetched on demand using keyset pagination, so memory stays
/// bounded. A fresh [`ReadingStore::range`] call re-runs the query.
pub struct RangeCursor {
    pool: SqlitePool,
    sensor_id: String,
    from_ms: i64,
    to_ms: i64,
    /// `(timestamp_ms, seq)` of the last row handed out
    after: Option<(i64, i64)>,
    page: VecDeque<StoredReading>,
    exhausted: bool,
}

impl RangeCursor {
    /// Next reading, or `None` once the window is exhausted
    pub async fn try_next(&mut self) -> Result<Option<StoredReading>, StoreError> {
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.page.pop_front())
    }

    /// Drain up to `limit` readings into a vector
    pub async fn collect(mut self, limit: usize) -> Result<Vec<StoredReading>, StoreError> {
        let mut out = Vec::new();
        while out.len() < limit {
            match self.try_next().await? {
                Some(reading) => out.push(reading),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let rows: Vec<ReadingRow> = match self.after {
            None => {
                sqlx::query_as(
                    "SELECT seq, sensor_id, metric, value, timestamp_ms, quality FROM readings \
                     WHERE sensor_id = ? AND timestamp_ms >= ? AND timestamp_ms <= ? \
                     ORDER BY timestamp_ms, seq LIMIT ?",
                )
                .bind(&self.sensor_id)
                .bind(self.from_ms)
                .bind(self.to_ms)
                .bind(RANGE_PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
            Some((last_ts, last_seq)) => {
                sqlx::query_as(
                    "SELECT seq, sensor_id, metric, value, timestamp_ms, quality FROM readings \
                     WHERE sensor_id = ? AND timestamp_ms <= ? \
                       AND (timestamp_ms > ? OR (timestamp_ms = ? AND seq > ?)) \
                     ORDER BY timestamp_ms, seq LIMIT ?",
                )
                .bind(&self.sensor_id)
                .bind(self.to_ms)
                .bind(last_ts)
                .bind(last_ts)
                .bind(last_seq)
                .bind(RANGE_PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?
            }
        };

        if (rows.len() as i64) < RANGE_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after = Some((last.timestamp_ms, last.seq));
        }
        for row in rows {
            self.page.push_back(StoredReading::try_from(row)?);
        }
        Ok(())
    }
}
