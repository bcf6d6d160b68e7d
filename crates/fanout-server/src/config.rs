//! Relay configuration
//!
//! Values come from built-in defaults, an optional `fanout.toml` next to the
//! working directory, and `FANOUT_`-prefixed environment variables, in that
//! order of precedence.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// ICE servers handed to every peer connection
    pub stun_servers: Vec<String>,
    /// Capacity of each publisher's inbound packet channel
    pub packet_channel_capacity: usize,
    /// Packets kept per pipeline for retransmission
    pub retransmit_cache_size: usize,
    /// Window over which a publisher's byte rate is measured
    pub rate_window_ms: u64,
    /// Interval between periodic keyframe requests
    pub keyframe_interval_ms: u64,
    /// Interval of the registry statistics sweep
    pub stats_interval_ms: u64,
    /// Lower bound of the bandwidth estimate, bytes per second
    pub bandwidth_low: u64,
    /// Upper bound of the bandwidth estimate, bytes per second
    pub bandwidth_high: u64,
    /// Consecutive write errors after which a subscriber is reported unhealthy
    pub max_consecutive_errors: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            packet_channel_capacity: 1000,
            retransmit_cache_size: 1024,
            rate_window_ms: 3000,
            keyframe_interval_ms: 1000,
            stats_interval_ms: 3000,
            bandwidth_low: 30 * 1000,
            bandwidth_high: 100 * 1000,
            max_consecutive_errors: 100,
        }
    }
}

impl RelayConfig {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("fanout").required(false))
            .add_source(
                config::Environment::with_prefix("FANOUT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?;

        let config: RelayConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.packet_channel_capacity == 0 {
            return Err(Error::Config("packet_channel_capacity must be positive".into()));
        }
        if self.retransmit_cache_size == 0 {
            return Err(Error::Config("retransmit_cache_size must be positive".into()));
        }
        if self.rate_window_ms == 0 || self.keyframe_interval_ms == 0 || self.stats_interval_ms == 0
        {
            return Err(Error::Config("intervals must be positive".into()));
        }
        if self.bandwidth_low > self.bandwidth_high {
            return Err(Error::Config(format!(
                "bandwidth_low ({}) exceeds bandwidth_high ({})",
                self.bandwidth_low, self.bandwidth_high
            )));
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}
