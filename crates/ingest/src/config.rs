//! Subscriber Configuration

use std::time::Duration;
use telemetry::DecoderConfig;

/// Backoff between broker reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound on any delay
    pub max_backoff: Duration,
    /// Consecutive failures tolerated; 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after `failures` consecutive failures (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether the reconnect budget is spent
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// MQTT broker host
    pub broker_host: String,
    /// MQTT broker port
    pub broker_port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Subscription filter (e.g. `sensors/#`)
    pub topic_pattern: String,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Messages buffered between broker and store writer
    pub queue_capacity: usize,
    /// Reconnect behaviour
    pub reconnect: ReconnectPolicy,
    /// How long `stop` waits for the drain
    pub stop_timeout: Duration,
    /// Payload decoding rules
    pub decoder: DecoderConfig,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "sensor-monitor".to_string(),
            topic_pattern: "sensors/#".to_string(),
            keep_alive: Duration::from_secs(30),
            queue_capacity: 1024,
            reconnect: ReconnectPolicy::default(),
            stop_timeout: Duration::from_secs(5),
            decoder: DecoderConfig::default(),
        }
    }
}
