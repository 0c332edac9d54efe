//! Schema Setup

use sqlx::SqlitePool;
use tracing::debug;

/// Idempotent DDL, applied in order on open
const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS readings (
        seq          INTEGER PRIMARY KEY AUTOINCREMENT,
        sensor_id    TEXT    NOT NULL,
        metric       TEXT    NOT NULL,
        value        REAL    NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        quality      TEXT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_readings_sensor_time
        ON readings (sensor_id, timestamp_ms, seq)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_readings_time
        ON readings (timestamp_ms)"#,
    r#"CREATE TABLE IF NOT EXISTS sensor_state (
        sensor_id     TEXT    PRIMARY KEY,
        last_seq      INTEGER NOT NULL,
        metric        TEXT    NOT NULL,
        value         REAL    NOT NULL,
        timestamp_ms  INTEGER NOT NULL,
        quality       TEXT,
        reading_count INTEGER NOT NULL
    )"#,
];

pub(crate) async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Schema ready ({} statements)", SCHEMA.len());
    Ok(())
}
