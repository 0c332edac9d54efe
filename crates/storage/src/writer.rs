//! Single-Writer Append Path

use crate::retry::with_retry;
use crate::store::{AppendResult, ReadingStore};
use crate::StoreError;
use std::time::Instant;
use telemetry::SensorReading;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Exclusive write capability for a [`ReadingStore`].
///
/// At most one exists per store. `append` takes `&mut self`, so appends
/// are serialized by ownership rather than by a lock. Dropping the writer
/// releases the slot and unblocks [`ReadingStore::close`].
pub struct StoreWriter {
    store: ReadingStore,
    _permit: OwnedSemaphorePermit,
}

impl StoreWriter {
    pub(crate) fn new(store: ReadingStore, permit: OwnedSemaphorePermit) -> Self {
        Self {
            store,
            _permit: permit,
        }
    }

    /// Persist a reading and update its sensor's state in one transaction.
    ///
    /// The state moves to this reading only if its timestamp is not older
    /// than the stored one; the row itself is always kept. Transient
    /// failures are retried per the store's [`RetryPolicy`](crate::RetryPolicy).
    pub async fn append(&mut self, reading: &SensorReading) -> Result<AppendResult, StoreError> {
        let started = Instant::now();
        let this: &StoreWriter = self;
        let result = with_retry(this.store.retry_policy(), move || this.try_append(reading)).await;

        metrics::histogram!("store_append_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn try_append(&self, reading: &SensorReading) -> Result<AppendResult, StoreError> {
        let timestamp_ms = reading.timestamp_ms();
        let quality = reading.quality.map(|q| q.as_str());

        let mut tx = self.store.pool().begin().await?;

        let seq = sqlx::query(
            "INSERT INTO readings (sensor_id, metric, value, timestamp_ms, quality) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&reading.sensor_id)
        .bind(reading.metric.as_str())
        .bind(reading.value)
        .bind(timestamp_ms)
        .bind(quality)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let current: Option<i64> =
            sqlx::query_scalar("SELECT timestamp_ms FROM sensor_state WHERE sensor_id = ?")
                .bind(&reading.sensor_id)
                .fetch_optional(&mut *tx)
                .await?;

        let state_advanced = current.map_or(true, |stored| timestamp_ms >= stored);

        if state_advanced {
            sqlx::query(
                "INSERT INTO sensor_state \
                   (sensor_id, last_seq, metric, value, timestamp_ms, quality, reading_count) \
                 VALUES (?, ?, ?, ?, ?, ?, 1) \
                 ON CONFLICT(sensor_id) DO UPDATE SET \
                   last_seq = excluded.last_seq, \
                   metric = excluded.metric, \
                   value = excluded.value, \
                   timestamp_ms = excluded.timestamp_ms, \
                   quality = excluded.quality, \
                   reading_count = sensor_state.reading_count + 1",
            )
            .bind(&reading.sensor_id)
            .bind(seq)
            .bind(reading.metric.as_str())
            .bind(reading.value)
            .bind(timestamp_ms)
            .bind(quality)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE sensor_state SET reading_count = reading_count + 1 WHERE sensor_id = ?",
            )
            .bind(&reading.sensor_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            sensor_id = %reading.sensor_id,
            seq,
            state_advanced,
            "Appended reading"
        );
        Ok(AppendResult {
            seq,
            state_advanced,
        })
    }
}
