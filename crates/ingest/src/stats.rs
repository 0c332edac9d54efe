//! Ingestion Counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals shared between the subscriber and readers
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
    append_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub append_failures: u64,
    pub reconnects: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_messages_total", "outcome" => "accepted").increment(1);
    }

    pub(crate) fn record_discarded(&self, reason: &'static str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_messages_total", "outcome" => "discarded", "reason" => reason)
            .increment(1);
    }

    pub(crate) fn record_append_failure(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_messages_total", "outcome" => "append_failed").increment(1);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_reconnects_total").increment(1);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
