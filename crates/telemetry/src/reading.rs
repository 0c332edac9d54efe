//! Sensor Reading Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of measurement carried by a reading
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Metric {
    Temperature,
    Humidity,
    /// Any other named measurement (pm25, light_lux, ...)
    Custom(String),
}

impl Metric {
    /// Canonical lowercase name, as stored and serialized
    pub fn as_str(&self) -> &str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Custom(name) => name,
        }
    }

    /// Rebuild a metric from its canonical name without normalizing it
    pub fn from_canonical(name: String) -> Self {
        match name.as_str() {
            "temperature" => Metric::Temperature,
            "humidity" => Metric::Humidity,
            _ => Metric::Custom(name),
        }
    }
}

impl From<&str> for Metric {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Metric::Temperature,
            "humidity" | "hum" => Metric::Humidity,
            other => Metric::Custom(other.to_string()),
        }
    }
}

impl From<String> for Metric {
    fn from(name: String) -> Self {
        Metric::from(name.as_str())
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.as_str().to_string()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data quality flag for readings recovered from bad input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Timestamp was replaced with arrival time
    Suspect,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Suspect => "suspect",
        }
    }

    /// Parse a stored quality flag
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "suspect" => Some(Quality::Suspect),
            _ => None,
        }
    }
}

/// One immutable sensor measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub metric: Metric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

impl SensorReading {
    /// Create a reading with no quality flag
    pub fn new(
        sensor_id: impl Into<String>,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            metric,
            value,
            timestamp,
            quality: None,
        }
    }

    /// Timestamp in Unix milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Whether the decoder had to recover this reading
    pub fn is_suspect(&self) -> bool {
        self.quality == Some(Quality::Suspect)
    }
}
