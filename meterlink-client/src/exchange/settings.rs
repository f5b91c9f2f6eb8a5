//! Exchange settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Preamble most DL/T 645 meters put in front of a response
pub const DEFAULT_PREAMBLE: [u8; 4] = [0xFE, 0xFE, 0xFE, 0xFE];

/// Exchange engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Deadline for receiving one response, measured from the end of the write
    #[serde(with = "meterlink_core::millis")]
    pub read_timeout: Duration,
    /// Retries after the first attempt on transport errors
    pub max_retries: u32,
    /// Pause between attempts
    #[serde(with = "meterlink_core::millis")]
    pub retry_delay: Duration,
    /// Marker stripped from the front of a response, as hex in config files.
    /// Empty disables stripping.
    #[serde(with = "preamble_hex")]
    pub preamble: Vec<u8>,
    /// Size of a single socket read
    pub read_chunk: usize,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(3000),
            max_retries: 3,
            retry_delay: Duration::from_millis(2000),
            preamble: DEFAULT_PREAMBLE.to_vec(),
            read_chunk: 1024,
        }
    }
}

impl ExchangeSettings {
    /// Create settings with the given read timeout and defaults elsewhere
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..Self::default()
        }
    }

    /// Set the retry budget
    ///
    /// # Arguments
    /// * `max_retries` - Retries after the first attempt
    /// * `retry_delay` - Pause between attempts
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Set the response preamble
    pub fn with_preamble(mut self, preamble: &[u8]) -> Self {
        self.preamble = preamble.to_vec();
        self
    }

    /// Total attempts for one exchange
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

mod preamble_hex {
    use meterlink_core::codec::{bytes_to_hex, hex_to_bytes};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(preamble: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bytes_to_hex(preamble))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex_to_bytes(&hex).map_err(D::Error::custom)
    }
}
