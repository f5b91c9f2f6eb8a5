//! Meter client
//!
//! Thin layer over `ExchangeEngine` for the two device families meterlink is
//! used with: DL/T 645 electricity meters and Modbus RTU devices behind
//! TCP gateways.

use crate::exchange::{Dlt645FrameLength, ExchangeEngine, FrameLength, ModbusRtuFrameLength};
use bytes::Bytes;
use meterlink_cache::{Connector, TcpConnector};
use meterlink_core::codec::{bytes_to_hex, hex_to_bytes};
use meterlink_core::{EndpointKey, LinkResult};

/// Meter client
pub struct MeterClient<C: Connector = TcpConnector> {
    engine: ExchangeEngine<C>,
}

impl<C: Connector> MeterClient<C> {
    /// Create a client over an engine
    pub fn new(engine: ExchangeEngine<C>) -> Self {
        Self { engine }
    }

    /// Get the underlying engine
    pub fn engine(&self) -> &ExchangeEngine<C> {
        &self.engine
    }

    /// Send a DL/T 645 command and read the response frame
    pub async fn dlt645(&self, key: &EndpointKey, command: &[u8]) -> LinkResult<Bytes> {
        self.engine.exchange(key, command, &Dlt645FrameLength).await
    }

    /// Send a Modbus RTU command (CRC included) and read the response frame
    pub async fn modbus(&self, key: &EndpointKey, command: &[u8]) -> LinkResult<Bytes> {
        let frame_length = ModbusRtuFrameLength::for_command(command);
        self.engine.exchange(key, command, &frame_length).await
    }

    /// Exchange with hex-encoded command and response
    ///
    /// # Arguments
    /// * `key` - Endpoint to talk to
    /// * `command` - Hex command, whitespace allowed
    /// * `frame_length` - Strategy computing the response length
    ///
    /// # Returns
    /// The response as uppercase hex
    pub async fn exchange_hex<F>(&self, key: &EndpointKey, command: &str, frame_length: &F) -> LinkResult<String>
    where
        F: FrameLength + ?Sized,
    {
        let command = hex_to_bytes(command)?;
        let frame = self.engine.exchange(key, &command, frame_length).await?;
        Ok(bytes_to_hex(&frame))
    }

    /// Force-close the connection for `key`
    pub async fn close(&self, key: &EndpointKey) -> bool {
        self.engine.close(key).await
    }

    /// Close every connection and stop the idle sweep
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
