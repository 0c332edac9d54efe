//! Decode Error Types

use thiserror::Error;

/// Reasons an inbound message is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Payload is not a JSON object or number
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Required field absent from both payload and topic
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Value present but not a number
    #[error("Value is not numeric: {0}")]
    NonNumericValue(String),

    /// Value outside the sanity range for its metric
    #[error("{metric} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        metric: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Sensor identifier is empty, too long, or contains topic characters
    #[error("Invalid sensor id: {0:?}")]
    InvalidSensorId(String),

    /// Metric name is empty or not a string
    #[error("Invalid metric: {0}")]
    InvalidMetric(String),
}

impl DecodeError {
    /// Stable reason code for logs and counters
    pub fn reason_code(&self) -> &'static str {
        match self {
            DecodeError::MalformedPayload(_) => "malformed_payload",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::NonNumericValue(_) => "non_numeric_value",
            DecodeError::OutOfRange { .. } => "out_of_range",
            DecodeError::InvalidSensorId(_) => "invalid_sensor_id",
            DecodeError::InvalidMetric(_) => "invalid_metric",
        }
    }
}
