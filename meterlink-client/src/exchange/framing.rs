//! Response framing
//!
//! The engine knows nothing about device protocols. It reads until a
//! `FrameLength` strategy, looking at the bytes received so far, says the
//! frame is complete.

use super::settings::ExchangeSettings;
use bytes::{Buf, Bytes, BytesMut};
use meterlink_core::codec::bytes_to_hex;
use meterlink_core::{LinkError, LinkResult};
use meterlink_transport::StreamAccessor;
use tokio::time::Instant;

/// Computes the total length of a response frame from its first bytes
pub trait FrameLength: Send + Sync {
    /// Bytes needed before `expected_len` can be evaluated
    fn min_len(&self) -> usize {
        4
    }

    /// Total frame length, given at least `min_len` bytes with the preamble
    /// already stripped
    ///
    /// Returning fewer bytes than `frame.len()` truncates the frame.
    fn expected_len(&self, frame: &[u8]) -> LinkResult<usize>;
}

impl<F> FrameLength for F
where
    F: Fn(&[u8]) -> LinkResult<usize> + Send + Sync,
{
    fn expected_len(&self, frame: &[u8]) -> LinkResult<usize> {
        self(frame)
    }
}

/// DL/T 645 frame length
///
/// `68 A0..A5 68 C L DATA CS 16`: the data length `L` sits at byte 9 and the
/// frame is `L + 12` bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dlt645FrameLength;

impl FrameLength for Dlt645FrameLength {
    fn min_len(&self) -> usize {
        10
    }

    fn expected_len(&self, frame: &[u8]) -> LinkResult<usize> {
        let data_len = frame.get(9).ok_or_else(|| {
            LinkError::FrameInvalid(format!(
                "DL/T 645 header needs 10 bytes, got {}",
                frame.len()
            ))
        })?;
        Ok(*data_len as usize + 12)
    }
}

/// Modbus RTU frame length (RTU framing carried over TCP)
///
/// # Rules
/// - Read functions `0x01..=0x04`: `byte_count + 5`
/// - Write single register `0x06`: echoes the command
/// - Other write functions `0x05`, `0x0F`, `0x10`: 8 bytes
/// - Exception responses: 5 bytes
/// - Anything else: whatever arrived
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusRtuFrameLength {
    /// Length of the command, used for echoed responses
    pub command_len: Option<usize>,
}

impl ModbusRtuFrameLength {
    /// Create a strategy for the response to `command`
    pub fn for_command(command: &[u8]) -> Self {
        Self {
            command_len: Some(command.len()),
        }
    }
}

impl FrameLength for ModbusRtuFrameLength {
    fn expected_len(&self, frame: &[u8]) -> LinkResult<usize> {
        let header = |index: usize| {
            frame.get(index).copied().ok_or_else(|| {
                LinkError::FrameInvalid(format!(
                    "Modbus header needs {} bytes, got {}",
                    index + 1,
                    frame.len()
                ))
            })
        };

        let len = match header(1)? {
            0x01..=0x04 => header(2)? as usize + 5,
            0x06 => self.command_len.unwrap_or(8),
            0x05 | 0x0F | 0x10 => 8,
            fc if fc & 0x80 != 0 => 5,
            _ => frame.len(),
        };
        Ok(len)
    }
}

fn strip_preamble(buf: &mut BytesMut, preamble: &[u8]) {
    if preamble.is_empty() {
        return;
    }
    while buf.starts_with(preamble) {
        buf.advance(preamble.len());
    }
}

/// Still waiting for the rest of a preamble
fn is_preamble_prefix(buf: &[u8], preamble: &[u8]) -> bool {
    !buf.is_empty() && buf.len() < preamble.len() && preamble.starts_with(buf)
}

/// Bytes read for one response
#[derive(Debug)]
pub(crate) struct Received {
    pub(crate) frame: Bytes,
    /// The strategy's expected length was reached. A partial frame leaves
    /// the rest of the response in flight on the stream.
    pub(crate) complete: bool,
}

/// Read one response frame from `stream`
///
/// Reads until `frame_length` reports a complete frame or `deadline` passes.
/// A deadline with nothing received is `LinkError::Timeout`; with something
/// received, the partial frame is returned. Bytes past the expected length are
/// discarded.
pub async fn read_frame<S, F>(
    stream: &mut S,
    frame_length: &F,
    settings: &ExchangeSettings,
    deadline: Instant,
) -> LinkResult<Bytes>
where
    S: StreamAccessor + ?Sized,
    F: FrameLength + ?Sized,
{
    receive(stream, frame_length, settings, deadline)
        .await
        .map(|received| received.frame)
}

pub(crate) async fn receive<S, F>(
    stream: &mut S,
    frame_length: &F,
    settings: &ExchangeSettings,
    deadline: Instant,
) -> LinkResult<Received>
where
    S: StreamAccessor + ?Sized,
    F: FrameLength + ?Sized,
{
    let mut buf = BytesMut::with_capacity(settings.read_chunk);
    let mut chunk = vec![0u8; settings.read_chunk.max(1)];
    let min_len = frame_length.min_len();
    let mut expected: Option<usize> = None;

    loop {
        if expected.is_none() {
            strip_preamble(&mut buf, &settings.preamble);
            if buf.len() >= min_len && !is_preamble_prefix(&buf, &settings.preamble) {
                let len = frame_length.expected_len(&buf)?;
                log::debug!("Expecting {} byte frame", len);
                expected = Some(len);
            }
        }

        if let Some(len) = expected {
            if buf.len() >= len {
                buf.truncate(len);
                log::debug!("Received frame: {}", bytes_to_hex(&buf));
                return Ok(Received {
                    frame: buf.freeze(),
                    complete: true,
                });
            }
        }

        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            // per-call transport timeout shorter than the read deadline
            Ok(Err(LinkError::Timeout)) if Instant::now() < deadline => continue,
            Err(_) | Ok(Err(LinkError::Timeout)) => {
                if buf.is_empty() {
                    return Err(LinkError::Timeout);
                }
                log::warn!(
                    "Read deadline passed, returning partial frame ({} of {:?} bytes): {}",
                    buf.len(),
                    expected,
                    bytes_to_hex(&buf)
                );
                return Ok(Received {
                    frame: buf.freeze(),
                    complete: false,
                });
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Err(LinkError::Connection(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "Peer closed the connection before responding",
                    )));
                }
                log::warn!(
                    "Peer closed the connection, returning partial frame: {}",
                    bytes_to_hex(&buf)
                );
                return Ok(Received {
                    frame: buf.freeze(),
                    complete: false,
                });
            }
            Ok(Ok(n)) => {
                log::debug!("Read {} bytes: {}", n, bytes_to_hex(&chunk[..n]));
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
