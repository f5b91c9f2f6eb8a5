//! Framed exchange client for meterlink
//!
//! This crate sends commands to metering devices and reads back responses
//! whose length is only known once their header has arrived.
//!
//! - `ExchangeEngine`: one request/response exchange per call, serialized per
//!   endpoint, retried on transport errors
//! - `FrameLength`: pluggable response length strategy, with DL/T 645 and
//!   Modbus RTU built in
//! - `MeterClient`: convenience wrapper for the built-in protocols

pub mod exchange;
pub mod meter;

pub use exchange::{
    DEFAULT_PREAMBLE, Dlt645FrameLength, ExchangeBuilder, ExchangeEngine, ExchangeSettings,
    FrameLength, ModbusRtuFrameLength,
};
pub use meter::MeterClient;
