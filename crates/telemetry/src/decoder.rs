//! Broker Payload Decoder
//!
//! Turns a raw `(topic, payload)` pair into a validated [`SensorReading`].
//! Identity and metric may come from the payload or from the topic
//! (`<prefix>/<sensor_id>[/<metric>]`); payload fields win when both exist.

use crate::error::DecodeError;
use crate::reading::{Metric, Quality, SensorReading};
use crate::validator::{ValidationConfig, Validator};
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Longest accepted sensor identifier
const MAX_SENSOR_ID_LEN: usize = 128;

/// Epoch values at or above this are treated as milliseconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

const SENSOR_ID_KEYS: [&str; 3] = ["sensor_id", "sensorId", "device_id"];
const METRIC_KEYS: [&str; 2] = ["metric", "type"];
const TIMESTAMP_KEYS: [&str; 2] = ["timestamp", "ts"];

/// Decoder configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// How far ahead of arrival time a claimed timestamp may be
    pub max_future_skew: Duration,
    /// Per-metric sanity ranges
    pub validation: ValidationConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::from_secs(300),
            validation: ValidationConfig::default(),
        }
    }
}

/// Sensor identity derived from a topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicRoute {
    pub sensor_id: Option<String>,
    pub metric: Option<Metric>,
}

impl TopicRoute {
    /// Parse `<prefix>/<sensor_id>[/<metric>]`
    pub fn parse(topic: &str) -> Self {
        let mut segments = topic.split('/').filter(|s| !s.is_empty()).skip(1);
        let sensor_id = segments.next().map(str::to_string);
        let metric = segments.next().map(Metric::from);
        Self { sensor_id, metric }
    }
}

/// Stateless payload decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    validator: Validator,
    /// `None` when the configured skew is beyond chrono's range
    max_future_skew: Option<chrono::Duration>,
}

impl Decoder {
    /// Create a new decoder
    pub fn new(config: DecoderConfig) -> Self {
        let max_future_skew = chrono::Duration::from_std(config.max_future_skew).ok();
        Self {
            validator: Validator::new(config.validation),
            max_future_skew,
        }
    }

    /// Decode a payload that arrived now
    pub fn decode(&self, payload: &[u8], topic: &str) -> Result<SensorReading, DecodeError> {
        self.decode_at(payload, topic, Utc::now())
    }

    /// Decode a payload with an explicit arrival time
    ///
    /// Timestamps are kept at millisecond precision, the resolution the
    /// store persists.
    pub fn decode_at(
        &self,
        payload: &[u8],
        topic: &str,
        received_at: DateTime<Utc>,
    ) -> Result<SensorReading, DecodeError> {
        let received_at = received_at.trunc_subsecs(3);
        let text = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::MalformedPayload("payload is not UTF-8".to_string()))?;
        let document: Value = serde_json::from_str(text.trim())
            .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

        let empty = Map::new();
        let (fields, bare_value) = match &document {
            Value::Object(map) => (map, None),
            Value::Number(_) => (&empty, Some(&document)),
            other => {
                return Err(DecodeError::MalformedPayload(format!(
                    "expected JSON object or number, got {}",
                    json_kind(other)
                )))
            }
        };

        let route = TopicRoute::parse(topic);

        let sensor_id = match first_field(fields, &SENSOR_ID_KEYS) {
            Some(Value::String(id)) => id.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => return Err(DecodeError::InvalidSensorId(other.to_string())),
            None => route.sensor_id.ok_or(DecodeError::MissingField("sensor_id"))?,
        };
        validate_sensor_id(&sensor_id)?;

        let metric = match first_field(fields, &METRIC_KEYS) {
            Some(Value::String(name)) => Metric::from(name.as_str()),
            Some(other) => return Err(DecodeError::InvalidMetric(other.to_string())),
            None => route.metric.ok_or(DecodeError::MissingField("metric"))?,
        };
        if metric.as_str().is_empty() {
            return Err(DecodeError::InvalidMetric("empty metric name".to_string()));
        }

        let value = match bare_value.or_else(|| fields.get("value")) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| DecodeError::NonNumericValue(n.to_string()))?,
            Some(other) => return Err(DecodeError::NonNumericValue(other.to_string())),
            None => return Err(DecodeError::MissingField("value")),
        };
        self.validator.validate(&metric, value)?;

        let latest_allowed = self
            .max_future_skew
            .and_then(|skew| received_at.checked_add_signed(skew));
        let (timestamp, quality) = match first_field(fields, &TIMESTAMP_KEYS) {
            None | Some(Value::Null) => (received_at, None),
            Some(raw) => match timestamp_from_json(raw).map(|ts| ts.trunc_subsecs(3)) {
                Some(ts) if latest_allowed.map_or(true, |limit| ts <= limit) => (ts, None),
                Some(ts) => {
                    debug!(%sensor_id, claimed = %ts, "Timestamp ahead of clock, using arrival time");
                    (received_at, Some(Quality::Suspect))
                }
                None => {
                    debug!(%sensor_id, raw = %raw, "Unparsable timestamp, using arrival time");
                    (received_at, Some(Quality::Suspect))
                }
            },
        };

        Ok(SensorReading {
            sensor_id,
            metric,
            value,
            timestamp,
            quality,
        })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

/// Parse a timestamp given as RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC), or
/// Unix epoch seconds/milliseconds
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(epoch) = text.parse::<f64>() {
        return from_epoch(epoch);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn from_epoch(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let millis = if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
        epoch
    } else {
        epoch * 1000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn first_field<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn validate_sensor_id(id: &str) -> Result<(), DecodeError> {
    let bad_char = id.chars().any(|c| matches!(c, '/' | '+' | '#') || c.is_control());
    if id.is_empty() || id.len() > MAX_SENSOR_ID_LEN || bad_char {
        return Err(DecodeError::InvalidSensorId(id.to_string()));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arrival() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_decode_full_payload() {
        let decoder = Decoder::default();
        let payload = br#"{"sensorId":"s1","metric":"temperature","value":21.5,"timestamp":"2023-11-14T22:13:00Z"}"#;

        let reading = decoder.decode_at(payload, "sensors/ignored", arrival()).unwrap();
        assert_eq!(reading.sensor_id, "s1");
        assert_eq!(reading.metric, Metric::Temperature);
        assert_eq!(reading.value, 21.5);
        assert_eq!(reading.timestamp, parse_timestamp("2023-11-14T22:13:00Z").unwrap());
        assert_eq!(reading.quality, None);
    }

    #[test]
    fn test_topic_routing_fills_missing_fields() {
        let decoder = Decoder::default();
        let reading = decoder
            .decode_at(b"55.0", "sensors/greenhouse-2/humidity", arrival())
            .unwrap();
        assert_eq!(reading.sensor_id, "greenhouse-2");
        assert_eq!(reading.metric, Metric::Humidity);
        assert_eq!(reading.value, 55.0);
        assert_eq!(reading.timestamp, arrival());
    }

    #[test]
    fn test_payload_overrides_topic() {
        let decoder = Decoder::default();
        let reading = decoder
            .decode_at(br#"{"device_id":"a","value":3}"#, "sensors/b/pm25", arrival())
            .unwrap();
        assert_eq!(reading.sensor_id, "a");
        assert_eq!(reading.metric, Metric::Custom("pm25".into()));
    }

    #[test]
    fn test_not_json_is_malformed() {
        let decoder = Decoder::default();
        let err = decoder.decode_at(b"not-json", "sensors/s1/temperature", arrival()).unwrap_err();
        assert_eq!(err.reason_code(), "malformed_payload");

        let err = decoder.decode_at(b"[1,2]", "sensors/s1/temperature", arrival()).unwrap_err();
        assert_eq!(err.reason_code(), "malformed_payload");
    }

    #[test]
    fn test_missing_fields() {
        let decoder = Decoder::default();
        let err = decoder.decode_at(br#"{"value":1}"#, "telemetry", arrival()).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("sensor_id"));

        let err = decoder.decode_at(br#"{"value":1}"#, "sensors/s1", arrival()).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("metric"));

        let err = decoder.decode_at(br#"{"metric":"humidity"}"#, "sensors/s1", arrival()).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("value"));
    }

    #[test]
    fn test_string_value_rejected() {
        let decoder = Decoder::default();
        let err = decoder
            .decode_at(br#"{"value":"21.5"}"#, "sensors/s1/temperature", arrival())
            .unwrap_err();
        assert_eq!(err.reason_code(), "non_numeric_value");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let decoder = Decoder::default();
        let err = decoder
            .decode_at(br#"{"value":140}"#, "sensors/s1/humidity", arrival())
            .unwrap_err();
        assert_eq!(err.reason_code(), "out_of_range");
    }

    #[test]
    fn test_invalid_sensor_id() {
        let decoder = Decoder::default();
        let err = decoder
            .decode_at(br#"{"sensor_id":"a/b","metric":"temperature","value":1}"#, "x", arrival())
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_sensor_id");

        let err = decoder
            .decode_at(br#"{"sensor_id":"  ","metric":"temperature","value":1}"#, "x", arrival())
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_sensor_id");
    }

    #[test]
    fn test_future_timestamp_is_flagged() {
        let decoder = Decoder::default();
        let future = arrival().timestamp_millis() + 3_600_000;
        let payload = format!(r#"{{"value":20,"timestamp":{future}}}"#);

        let reading = decoder
            .decode_at(payload.as_bytes(), "sensors/s1/temperature", arrival())
            .unwrap();
        assert_eq!(reading.timestamp, arrival());
        assert_eq!(reading.quality, Some(Quality::Suspect));
    }

    #[test]
    fn test_small_skew_is_tolerated() {
        let decoder = Decoder::default();
        let ahead = arrival().timestamp_millis() + 10_000;
        let payload = format!(r#"{{"value":20,"timestamp":{ahead}}}"#);

        let reading = decoder
            .decode_at(payload.as_bytes(), "sensors/s1/temperature", arrival())
            .unwrap();
        assert_eq!(reading.timestamp_ms(), ahead);
        assert_eq!(reading.quality, None);
    }

    #[test]
    fn test_huge_skew_accepts_without_overflow() {
        let decoder = Decoder::new(DecoderConfig {
            max_future_skew: Duration::from_secs(1_000_000_000_000_000),
            ..Default::default()
        });
        let ahead = arrival().timestamp_millis() + 3_600_000;
        let payload = format!(r#"{{"value":20,"timestamp":{ahead}}}"#);

        let reading = decoder
            .decode_at(payload.as_bytes(), "sensors/s1/temperature", arrival())
            .unwrap();
        assert_eq!(reading.timestamp_ms(), ahead);
        assert_eq!(reading.quality, None);

        let unbounded = Decoder::new(DecoderConfig {
            max_future_skew: Duration::MAX,
            ..Default::default()
        });
        let reading = unbounded
            .decode_at(payload.as_bytes(), "sensors/s1/temperature", arrival())
            .unwrap();
        assert_eq!(reading.quality, None);
    }

    #[test]
    fn test_timestamps_truncated_to_millis() {
        let decoder = Decoder::default();
        let reading = decoder
            .decode_at(
                br#"{"value":20,"timestamp":"2023-11-14T22:13:00.123456789Z"}"#,
                "sensors/s1/temperature",
                arrival(),
            )
            .unwrap();
        assert_eq!(reading.timestamp.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(
            Some(reading.timestamp),
            Utc.timestamp_millis_opt(reading.timestamp_ms()).single()
        );

        let received = arrival() + chrono::Duration::nanoseconds(456_789);
        let stamped = decoder
            .decode_at(br#"{"value":20}"#, "sensors/s1/temperature", received)
            .unwrap();
        assert_eq!(stamped.timestamp, arrival());
    }

    #[test]
    fn test_garbage_timestamp_is_flagged() {
        let decoder = Decoder::default();
        let reading = decoder
            .decode_at(br#"{"value":20,"ts":"yesterday"}"#, "sensors/s1/temperature", arrival())
            .unwrap();
        assert_eq!(reading.timestamp, arrival());
        assert!(reading.is_suspect());
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(parse_timestamp("1700000000"), Some(expected));
        assert_eq!(parse_timestamp("1700000000000"), Some(expected));
        assert_eq!(parse_timestamp("2023-11-14T22:13:20Z"), Some(expected));
        assert_eq!(parse_timestamp("2023-11-14 22:13:20"), Some(expected));
        assert_eq!(parse_timestamp("soon"), None);
    }

    #[test]
    fn test_topic_route_parse() {
        assert_eq!(TopicRoute::parse("sensors"), TopicRoute::default());
        let route = TopicRoute::parse("/sensors/s9/temp");
        assert_eq!(route.sensor_id.as_deref(), Some("s9"));
        assert_eq!(route.metric, Some(Metric::Temperature));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..256),
                                    topic in "[a-z/#+]{0,24}") {
            let _ = Decoder::default().decode_at(&payload, &topic, arrival());
        }

        #[test]
        fn prop_in_range_temperature_accepted(value in -50.0f64..=100.0) {
            let payload = serde_json::json!({ "value": value }).to_string();
            let reading = Decoder::default()
                .decode_at(payload.as_bytes(), "sensors/s1/temperature", arrival())
                .unwrap();
            prop_assert_eq!(reading.value, value);
        }
    }
}
