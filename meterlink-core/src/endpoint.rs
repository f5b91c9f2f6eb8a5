use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one remote device connection slot
///
/// A key is a `(host, port)` pair. Its canonical string form is `host:port`,
/// with IPv6 literals bracketed (`[fe80::1]:502`). Two keys naming the same
/// host and port always share one cached connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointKey {
    host: String,
    port: u16,
}

impl EndpointKey {
    /// Create a new endpoint key
    ///
    /// # Arguments
    ///
    /// * `host` - Host name or IP address, without brackets
    /// * `port` - TCP port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Parse an endpoint key from `host:port` format
    ///
    /// # Returns
    ///
    /// Returns `Err(LinkError::InvalidData)` when the port is missing or not a
    /// valid `u16`, or when the host is empty.
    pub fn parse(s: &str) -> LinkResult<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LinkError::InvalidData(format!("Missing port in endpoint: {}", s)))?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            inner.strip_suffix(']').ok_or_else(|| {
                LinkError::InvalidData(format!("Unterminated IPv6 literal in endpoint: {}", s))
            })?
        } else if host.contains(':') {
            return Err(LinkError::InvalidData(format!(
                "IPv6 endpoint must be bracketed: {}",
                s
            )));
        } else {
            host
        };

        if host.is_empty() {
            return Err(LinkError::InvalidData(format!("Missing host in endpoint: {}", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| LinkError::InvalidData(format!("Invalid port in endpoint: {}", s)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Get the host part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port part
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndpointKey {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EndpointKey {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EndpointKey> for String {
    fn from(key: EndpointKey) -> Self {
        key.to_string()
    }
}

impl From<std::net::SocketAddr> for EndpointKey {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
