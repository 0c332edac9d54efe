//! Per-Metric Range Validation

use crate::error::DecodeError;
use crate::reading::Metric;
use serde::{Deserialize, Serialize};

/// Validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Temperature valid range (°C)
    pub temperature_range: (f64, f64),
    /// Relative humidity valid range (%)
    pub humidity_range: (f64, f64),
    /// Range applied to custom metrics; `None` accepts any finite value
    pub custom_range: Option<(f64, f64)>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            temperature_range: (-50.0, 100.0),
            humidity_range: (0.0, 100.0),
            custom_range: None,
        }
    }
}

/// Range checker for decoded values
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    /// Create a new validator with given config
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Sanity range for a metric, if one applies
    pub fn range_for(&self, metric: &Metric) -> Option<(f64, f64)> {
        match metric {
            Metric::Temperature => Some(self.config.temperature_range),
            Metric::Humidity => Some(self.config.humidity_range),
            Metric::Custom(_) => self.config.custom_range,
        }
    }

    /// Validate a value for its metric
    pub fn validate(&self, metric: &Metric, value: f64) -> Result<(), DecodeError> {
        if !value.is_finite() {
            return Err(DecodeError::NonNumericValue(value.to_string()));
        }

        match self.range_for(metric) {
            Some((min, max)) if value < min || value > max => Err(DecodeError::OutOfRange {
                metric: metric.to_string(),
                value,
                min,
                max,
            }),
            _ => Ok(()),
        }
    }
}
