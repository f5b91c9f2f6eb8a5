//! Connection cache settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection cache configuration
///
/// # Derived Limits
/// - Idle threshold: `timeout × idle_multiplier`. A cached connection unused for
///   longer is closed by the sweep or replaced on the next acquire.
/// - Sweep period: `timeout`.
/// - Lease wait budget: `timeout / poll_interval` polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Base timeout: sweep period, lease wait budget and socket I/O timeout
    #[serde(with = "meterlink_core::millis")]
    pub timeout: Duration,
    /// Multiplier applied to `timeout` to get the idle threshold
    pub idle_multiplier: u32,
    /// How often a waiting acquirer re-checks a leased key
    #[serde(with = "meterlink_core::millis")]
    pub poll_interval: Duration,
    /// Upper bound for one connect attempt
    #[serde(with = "meterlink_core::millis")]
    pub connect_timeout: Duration,
    /// Maximum number of endpoint keys tracked at once
    pub max_keys: usize,
    /// Enable TCP keep-alive on new connections
    pub keepalive: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            idle_multiplier: 10,
            poll_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(3000),
            max_keys: 6,
            keepalive: true,
        }
    }
}

impl CacheSettings {
    /// Create settings with the given base timeout and defaults elsewhere
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Set the lease poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the idle multiplier
    pub fn with_idle_multiplier(mut self, idle_multiplier: u32) -> Self {
        self.idle_multiplier = idle_multiplier;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the maximum number of tracked endpoint keys
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Idle threshold after which a cached connection is reclaimed
    pub fn idle_threshold(&self) -> Duration {
        self.timeout.saturating_mul(self.idle_multiplier)
    }

    /// Number of polls a waiting acquirer performs before giving up
    pub fn max_polls(&self) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        (self.timeout.as_millis() / poll).min(u32::MAX as u128) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let settings = CacheSettings::default();
        assert_eq!(settings.idle_threshold(), Duration::from_secs(30));
        assert_eq!(settings.max_polls(), 15);
    }

    #[test]
    fn test_builder_methods() {
        let settings = CacheSettings::new(Duration::from_millis(1000))
            .with_poll_interval(Duration::from_millis(200))
            .with_idle_multiplier(2)
            .with_max_keys(32);
        assert_eq!(settings.max_polls(), 5);
        assert_eq!(settings.idle_threshold(), Duration::from_millis(2000));
        assert_eq!(settings.max_keys, 32);
    }

    #[test]
    fn test_serde_millis() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{"timeout": 500, "poll_interval": 100}"#).unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.max_polls(), 5);
        assert_eq!(settings.idle_multiplier, 10);

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["connect_timeout"], 3000);
    }
}
