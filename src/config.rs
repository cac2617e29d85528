//! Configuration management for the ingestion layer
//!
//! Loads from optional config files + environment variables via .env.
//! All tuning parameters are immutable after load and shared by every
//! connector through an `Arc<ServiceConfig>`.

use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Immutable tuning parameters shared by all connectors.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub stream: StreamConfig,
    pub poll: PollConfig,
    pub cache: CacheConfig,
    pub errors: ErrorConfig,
    pub startup: StartupConfig,
    pub endpoints: EndpointConfig,
}

/// Push-connector tuning: reconnect policy and keep-alive cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Automatic reconnects before the connector goes terminally disconnected.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub base_reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_delay_ms: u64,
    /// Connections that die within this window of opening are treated as
    /// flapping and are not automatically retried.
    pub min_reconnect_spacing_ms: u64,
    /// Keep-alive frame interval on an open stream.
    pub heartbeat_interval_secs: u64,
}

impl StreamConfig {
    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn min_reconnect_spacing(&self) -> Duration {
        Duration::from_millis(self.min_reconnect_spacing_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Poll-connector tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Poll interval while the market is open.
    pub open_interval_secs: u64,
    /// Poll interval while the market is closed.
    pub closed_interval_secs: u64,
    /// Rows requested per page; load-more grows the effective limit by this.
    pub page_size: usize,
    /// Delay before the background refresh that follows a cache-first emit.
    pub background_refresh_delay_ms: u64,
}

impl PollConfig {
    pub fn open_interval(&self) -> Duration {
        Duration::from_secs(self.open_interval_secs)
    }

    pub fn closed_interval(&self) -> Duration {
        Duration::from_secs(self.closed_interval_secs)
    }

    pub fn background_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.background_refresh_delay_ms)
    }
}

/// Snapshot staleness tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// A cached snapshot older than this is stale and never served.
    pub max_age_secs: u64,
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Consecutive-error backoff tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorConfig {
    /// Consecutive failures that suspend polling.
    pub consecutive_threshold: u32,
    /// Suspension length before polling resumes with a clean counter.
    pub cooldown_secs: u64,
}

impl ErrorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Orchestrator startup and market-watch tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    /// Delay step between consecutive connector startups.
    pub stagger_ms: u64,
    /// Market open/closed check interval.
    pub market_check_secs: u64,
}

impl StartupConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn market_check(&self) -> Duration {
        Duration::from_secs(self.market_check_secs)
    }
}

/// Backing service endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for streaming connections (wss://...).
    pub stream_base: String,
    /// Base URL for snapshot polling (https://...).
    pub rest_base: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig {
                max_reconnect_attempts: 5,
                base_reconnect_delay_ms: 1_000,
                max_reconnect_delay_ms: 30_000,
                min_reconnect_spacing_ms: 10_000,
                heartbeat_interval_secs: 60,
            },
            poll: PollConfig {
                open_interval_secs: 30,
                closed_interval_secs: 300,
                page_size: 20,
                background_refresh_delay_ms: 250,
            },
            cache: CacheConfig { max_age_secs: 30 },
            errors: ErrorConfig {
                consecutive_threshold: 3,
                cooldown_secs: 60,
            },
            startup: StartupConfig {
                stagger_ms: 500,
                market_check_secs: 60,
            },
            endpoints: EndpointConfig {
                stream_base: "wss://stream.marketfeed.dev".to_string(),
                rest_base: "https://api.marketfeed.dev".to_string(),
            },
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file and environment.
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let defaults = ServiceConfig::default();
        let config = Config::builder()
            // Stream defaults
            .set_default(
                "stream.max_reconnect_attempts",
                u64::from(defaults.stream.max_reconnect_attempts),
            )?
            .set_default(
                "stream.base_reconnect_delay_ms",
                defaults.stream.base_reconnect_delay_ms,
            )?
            .set_default(
                "stream.max_reconnect_delay_ms",
                defaults.stream.max_reconnect_delay_ms,
            )?
            .set_default(
                "stream.min_reconnect_spacing_ms",
                defaults.stream.min_reconnect_spacing_ms,
            )?
            .set_default(
                "stream.heartbeat_interval_secs",
                defaults.stream.heartbeat_interval_secs,
            )?
            // Poll defaults
            .set_default("poll.open_interval_secs", defaults.poll.open_interval_secs)?
            .set_default(
                "poll.closed_interval_secs",
                defaults.poll.closed_interval_secs,
            )?
            .set_default("poll.page_size", defaults.poll.page_size as u64)?
            .set_default(
                "poll.background_refresh_delay_ms",
                defaults.poll.background_refresh_delay_ms,
            )?
            // Cache defaults
            .set_default("cache.max_age_secs", defaults.cache.max_age_secs)?
            // Error backoff defaults
            .set_default(
                "errors.consecutive_threshold",
                u64::from(defaults.errors.consecutive_threshold),
            )?
            .set_default("errors.cooldown_secs", defaults.errors.cooldown_secs)?
            // Startup defaults
            .set_default("startup.stagger_ms", defaults.startup.stagger_ms)?
            .set_default(
                "startup.market_check_secs",
                defaults.startup.market_check_secs,
            )?
            // Endpoint defaults
            .set_default("endpoints.stream_base", defaults.endpoints.stream_base)?
            .set_default("endpoints.rest_base", defaults.endpoints.rest_base)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (MARKETFEED_*)
            .add_source(Environment::with_prefix("MARKETFEED").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let service_config: ServiceConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(service_config)
    }

    /// Generate a digest of the config for startup logging.
    pub fn digest(&self) -> String {
        format!(
            "reconnect={}x base={}ms poll={}s/{}s cache={}s errors={}x/{}s",
            self.stream.max_reconnect_attempts,
            self.stream.base_reconnect_delay_ms,
            self.poll.open_interval_secs,
            self.poll.closed_interval_secs,
            self.cache.max_age_secs,
            self.errors.consecutive_threshold,
            self.errors.cooldown_secs,
        )
    }
}

impl std::fmt::Display for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let config = ServiceConfig::default();
        assert!(config.stream.base_reconnect_delay_ms <= config.stream.max_reconnect_delay_ms);
        assert!(config.poll.open_interval_secs <= config.poll.closed_interval_secs);
        assert_eq!(config.cache.max_age(), Duration::from_secs(30));
    }

    #[test]
    fn digest_mentions_key_tuning() {
        let digest = ServiceConfig::default().digest();
        assert!(digest.contains("reconnect=5x"));
        assert!(digest.contains("poll=30s/300s"));
    }
}
