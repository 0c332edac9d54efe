//! Ingestion Subscriber
//!
//! Owns the broker connection and is the only writer to the reading store:
//! - MQTT event loop with reconnect backoff
//! - Bounded queue between broker callbacks and the store writer
//! - Decode failures counted and discarded, store failures escalated
//! - Cooperative stop with a bounded drain

mod broker;
mod config;
mod stats;
mod subscriber;
mod worker;

pub use config::{ReconnectPolicy, SubscriberConfig};
pub use stats::{IngestSnapshot, IngestStats};
pub use subscriber::{IngestMonitor, Subscriber};

use chrono::{DateTime, Utc};
use serde::Serialize;
use storage::StoreError;
use thiserror::Error;

/// Errors returned by subscriber control calls
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Subscriber already started")]
    AlreadyStarted,
    #[error("Subscriber has been stopped")]
    Stopped,
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Conditions that should shut the process down
#[derive(Debug, Error)]
pub enum IngestFault {
    #[error("Store failure: {0}")]
    Store(StoreError),
    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    BrokerUnreachable { attempts: u32, last_error: String },
    #[error("Ingest worker panicked: {0}")]
    WorkerPanicked(String),
}

/// How a call to [`Subscriber::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Was never started or already stopped
    NotRunning,
    /// Queue drained and tasks exited in time
    Graceful,
    /// Timed out; tasks were aborted
    Ungraceful,
}

/// Connection lifecycle as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
    Stopped,
}

impl SubscriberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connecting => "connecting",
            SubscriberState::Subscribed => "subscribed",
            SubscriberState::Reconnecting => "reconnecting",
            SubscriberState::Stopped => "stopped",
        }
    }

    /// Whether messages are currently flowing in
    pub fn is_online(&self) -> bool {
        matches!(self, SubscriberState::Subscribed)
    }
}

/// A raw message as received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Message stamped with the current time
    pub fn now(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}
