//! Per-IP Rate Limiting
//!
//! GCRA limiter from tower_governor, keyed by peer address. The service
//! must be served with `into_make_service_with_connect_info::<SocketAddr>()`
//! for the key extractor to see the client IP.

use governor::middleware::StateInformationMiddleware;
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::GovernorLayer;

use crate::AppConfig;

/// Governor config with X-RateLimit-* response headers
pub type DefaultGovernorConfig =
    tower_governor::governor::GovernorConfig<PeerIpKeyExtractor, StateInformationMiddleware>;

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Seconds to replenish one request
    pub per_second: u64,
    /// Requests allowed back to back
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 1,
            burst_size: 50,
        }
    }
}

impl RateLimitConfig {
    /// Limits from the application config, or `None` when disabled
    pub fn from_app(config: &AppConfig) -> Option<Self> {
        config.rate_limit_enabled.then(|| Self {
            per_second: config.rate_limit_per_second,
            burst_size: config.rate_limit_burst,
        })
    }
}

/// Build the governor config; `None` if the quota is zero
pub fn create_governor_config(config: &RateLimitConfig) -> Option<Arc<DefaultGovernorConfig>> {
    GovernorConfigBuilder::default()
        .per_second(config.per_second)
        .burst_size(config.burst_size)
        .use_headers()
        .finish()
        .map(Arc::new)
}

/// Layer enforcing `config`
pub fn governor_layer(
    config: &RateLimitConfig,
) -> Option<GovernorLayer<PeerIpKeyExtractor, StateInformationMiddleware>> {
    create_governor_config(config).map(|config| GovernorLayer { config })
}
