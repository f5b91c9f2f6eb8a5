//! Transport layer module for meterlink
//!
//! This crate provides the stream abstraction the connection cache hands out
//! and its TCP implementation.

pub mod stream;
pub mod tcp;

pub use meterlink_core::{LinkError, LinkResult};
pub use stream::{StreamAccessor, TransportLayer};
pub use tcp::{TcpSettings, TcpTransport};
