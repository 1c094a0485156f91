//! Feed engine configuration.

use std::time::Duration;

/// Upstream odds-feed WebSocket URL.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://zplay1.in/socket.io/?EIO=4&transport=websocket";

/// Tunables for the upstream feed engine.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket URL of the odds provider.
    pub upstream_url: String,
    /// Interval between keepalive sweeps over the pool.
    pub sweep_interval: Duration,
    /// Idle gap after which an open connection is proactively probed.
    pub staleness_threshold: Duration,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Cap for the exponential reconnect backoff.
    pub reconnect_max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up on an event.
    pub max_reconnect_attempts: u32,
    /// Per-address TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            sweep_interval: Duration::from_secs(15),
            staleness_threshold: Duration::from_secs(20),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 6,
            connect_timeout: Duration::from_secs(5),
        }
    }
}
