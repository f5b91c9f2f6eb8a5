//! Core types and utilities for meterlink
//!
//! This crate provides the error taxonomy, endpoint keys and the pure byte
//! codecs used throughout the meterlink workspace.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod millis;

pub use endpoint::EndpointKey;
pub use error::{LinkError, LinkResult};
