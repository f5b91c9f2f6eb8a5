//! meterlink - connection cache and framed exchanges for metering devices
//!
//! Talks to electricity meters and Modbus-class controllers over TCP: one
//! cached connection per device endpoint, request/response exchanges with
//! dynamic response framing, and bounded retries.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `meterlink-core`: Error handling, endpoint keys, hex and checksum codecs
//! - `meterlink-transport`: Transport layer (TCP)
//! - `meterlink-cache`: Keyed single-slot connection cache with idle sweep
//! - `meterlink-client`: Exchange engine, frame length strategies, meter client
//!
//! # Implementation Status
//!
//! ## ✅ 已完成
//! - 连接缓存（每个端点一个连接、租约、空闲回收、容量上限）
//! - 请求/响应交换（端点互斥、动态帧长、前导符剥离、重试）
//! - DL/T 645 与 Modbus RTU 帧长策略
//! - TCP 传输层（连接超时、keep-alive）
//!
//! ## 📋 待实现
//! - 串口传输层
//!
//! # Usage
//!
//! ```no_run
//! use meterlink::client::ExchangeBuilder;
//!
//! # async fn run() -> meterlink::LinkResult<()> {
//! let client = ExchangeBuilder::new().build_client()?;
//! let key: meterlink::EndpointKey = "192.168.1.20:8899".parse()?;
//! let hex = client
//!     .exchange_hex(&key, "01 03 00 00 00 01 84 0A", &meterlink::client::ModbusRtuFrameLength::default())
//!     .await?;
//! println!("{}", hex);
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use meterlink_core::codec;
pub use meterlink_core::{EndpointKey, LinkError, LinkResult};

// Re-export transport API
pub mod transport {
    pub use meterlink_transport::*;
}

// Re-export cache API
pub mod cache {
    pub use meterlink_cache::*;
}

// Re-export client API
pub mod client {
    pub use meterlink_client::*;
}
