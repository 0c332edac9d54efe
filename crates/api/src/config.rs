//! Application Configuration
//!
//! Defaults, then an optional TOML file, then environment variables.
//! Keys match the environment variable names in lower case, so
//! `WEB_PORT=8080` and `web_port = 8080` in the file set the same value.

use config::{Config, Environment, File, FileFormat};
use ingest::{ReconnectPolicy, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::{RetryPolicy, StoreConfig};
use telemetry::DecoderConfig;
use thiserror::Error;

/// File read when `MONITOR_CONFIG` is not set
pub const DEFAULT_CONFIG_FILE: &str = "sensor-monitor.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "MONITOR_CONFIG";

/// Upper bound for `future_skew_secs` (one year)
pub const MAX_FUTURE_SKEW_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Complete process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub web_host: String,
    pub web_port: u16,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_client_id: String,
    pub db_path: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Forces debug logging
    pub debug: bool,
    /// Sensors silent for longer than this count as stale
    pub freshness_window_secs: u64,
    pub future_skew_secs: u64,
    pub stop_timeout_secs: u64,
    /// 0 retries the broker forever
    pub reconnect_max_attempts: u32,
    pub append_max_retries: u32,
    pub queue_capacity: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            web_host: "0.0.0.0".to_string(),
            web_port: 5000,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "sensors/#".to_string(),
            mqtt_client_id: format!("sensor-monitor-{}", &suffix[..8]),
            db_path: PathBuf::from("data/iot_sensor_data.db"),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            debug: false,
            freshness_window_secs: 300,
            future_skew_secs: 300,
            stop_timeout_secs: 5,
            reconnect_max_attempts: 0,
            append_max_retries: 3,
            queue_capacity: 1024,
            rate_limit_enabled: false,
            rate_limit_per_second: 1,
            rate_limit_burst: 50,
        }
    }
}

impl AppConfig {
    /// Load from `MONITOR_CONFIG` (or `sensor-monitor.toml` if present) and
    /// the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::from_sources(file.as_deref(), Environment::default().try_parsing(true))
    }

    /// Layer `file` (required when given) and `env` over the defaults
    pub fn from_sources(file: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let file = match file {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt_topic must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.future_skew_secs > MAX_FUTURE_SKEW_SECS {
            return Err(ConfigError::Invalid(format!(
                "future_skew_secs must be at most {MAX_FUTURE_SKEW_SECS}"
            )));
        }
        if self.rate_limit_enabled && (self.rate_limit_per_second == 0 || self.rate_limit_burst == 0)
        {
            return Err(ConfigError::Invalid(
                "rate limit period and burst must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Address the query service binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.web_host, self.web_port)
    }

    /// Effective log level after the `debug` override
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            retry: RetryPolicy {
                max_retries: self.append_max_retries,
                ..Default::default()
            },
            ..StoreConfig::new(self.db_path.clone())
        }
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            broker_host: self.mqtt_broker.clone(),
            broker_port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            topic_pattern: self.mqtt_topic.clone(),
            queue_capacity: self.queue_capacity,
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts,
                ..Default::default()
            },
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            decoder: DecoderConfig {
                max_future_skew: Duration::from_secs(self.future_skew_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
