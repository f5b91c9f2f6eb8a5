use crate::endpoint::EndpointKey;
use thiserror::Error;

/// Main error type for meterlink operations
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Failed to connect to {key}: {source}")]
    Connect {
        key: EndpointKey,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout")]
    Timeout,

    #[error("No available connection for {key} after {polls} polls")]
    NoAvailableConnection { key: EndpointKey, polls: u32 },

    #[error("Connection cache is full ({max_keys} endpoints, all leased)")]
    CacheFull { max_keys: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("Exchange with {key} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: EndpointKey,
        attempts: u32,
        #[source]
        source: Box<LinkError>,
    },

    #[error("Connection cache has been shut down")]
    Shutdown,
}

impl LinkError {
    /// Whether the error came from the transport and the exchange may be retried
    /// on a fresh connection.
    ///
    /// Lease contention, capacity and framing errors are not transport errors:
    /// retrying them against the same endpoint would not change the outcome.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LinkError::Connection(_) | LinkError::Connect { .. } | LinkError::Timeout
        )
    }

    /// Whether the error is a socket-level failure on an established connection
    pub fn is_socket(&self) -> bool {
        matches!(self, LinkError::Connection(_))
    }
}

/// Result type alias for meterlink operations
pub type LinkResult<T> = Result<T, LinkError>;
