//! Framed exchange module

pub mod builder;
pub mod engine;
pub mod framing;
pub mod settings;

pub use builder::ExchangeBuilder;
pub use engine::ExchangeEngine;
pub use framing::{Dlt645FrameLength, FrameLength, ModbusRtuFrameLength, read_frame};
pub use settings::{DEFAULT_PREAMBLE, ExchangeSettings};
