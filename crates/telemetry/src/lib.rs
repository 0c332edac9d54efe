//! Sensor Telemetry Model and Decoding
//!
//! Provides the sensor reading model, topic routing, payload decoding,
//! and per-metric range validation for inbound broker messages.

mod decoder;
mod error;
mod reading;
mod validator;

pub use decoder::{parse_timestamp, Decoder, DecoderConfig, TopicRoute};
pub use error::DecodeError;
pub use reading::{Metric, Quality, SensorReading};
pub use validator::{ValidationConfig, Validator};
