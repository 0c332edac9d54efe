//! Storage Layer
//!
//! Durable SQLite store for sensor readings and the per-sensor state
//! derived from them. Appends go through a single [`StoreWriter`];
//! queries run on a WAL-mode pool and never wait on the writer.

mod retry;
mod schema;
mod store;
mod writer;

pub use retry::RetryPolicy;
pub use store::{
    AppendResult, RangeCursor, ReadingStore, ReadingTotals, SensorActivity, SensorState,
    StoreConfig, StoredReading,
};
pub use writer::StoreWriter;

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Busy/locked database, I/O hiccup, or pool timeout; worth retrying
    #[error("Transient storage error: {0}")]
    Transient(String),
    /// Non-retryable database error
    #[error("Database error: {0}")]
    Database(String),
    /// Append gave up after the retry budget was spent
    #[error("Append failed after {attempts} attempts: {reason}")]
    Fatal { attempts: u32, reason: String },
    #[error("Store is closed")]
    Closed,
    #[error("Another writer is already active")]
    WriterBusy,
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Errors that should stop ingestion
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal { .. } | StoreError::Closed)
    }
}

/// Primary SQLite result codes that clear up on their own:
/// BUSY, LOCKED and IOERR
const TRANSIENT_SQLITE_CODES: [i64; 3] = [5, 6, 10];

/// Extended result codes carry the primary code in the low byte
fn is_transient_code(code: &str) -> bool {
    code.parse::<i64>()
        .is_ok_and(|code| TRANSIENT_SQLITE_CODES.contains(&(code & 0xff)))
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolClosed => StoreError::Closed,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                StoreError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) if db.code().is_some_and(|code| is_transient_code(&code)) => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Closed
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    /// Database error carrying a raw SQLite result code
    #[derive(Debug, Error)]
    #[error("sqlite error {code}")]
    struct CodedError {
        code: &'static str,
    }

    impl sqlx::error::DatabaseError for CodedError {
        fn message(&self) -> &str {
            "sqlite error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn classify(code: &'static str) -> StoreError {
        StoreError::from(sqlx::Error::Database(Box::new(CodedError { code })))
    }

    #[test]
    fn test_extended_codes_are_transient() {
        // BUSY, BUSY_RECOVERY, BUSY_TIMEOUT, LOCKED, LOCKED_SHAREDCACHE,
        // IOERR, IOERR_READ, IOERR_WRITE, IOERR_FSYNC
        for code in ["5", "261", "773", "6", "262", "10", "266", "778", "1034"] {
            assert!(
                matches!(classify(code), StoreError::Transient(_)),
                "code {code} should be transient"
            );
        }
    }

    #[test]
    fn test_hard_codes_are_not_transient() {
        // ERROR, CONSTRAINT, CONSTRAINT_UNIQUE, CORRUPT, FULL
        for code in ["1", "19", "2067", "11", "13"] {
            assert!(
                matches!(classify(code), StoreError::Database(_)),
                "code {code} should not be transient"
            );
        }
        assert!(matches!(classify("not-a-code"), StoreError::Database(_)));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(StoreError::Closed.is_fatal());
        assert!(StoreError::Fatal { attempts: 4, reason: "disk".into() }.is_fatal());
        assert!(!StoreError::Transient("busy".into()).is_fatal());
        assert!(!StoreError::WriterBusy.is_fatal());
    }
}
