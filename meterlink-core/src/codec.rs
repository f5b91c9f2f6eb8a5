//! Byte codecs shared by protocol callers
//!
//! These are pure functions. The exchange engine never calls them; protocol
//! callers use them to build commands and to validate returned frames.

use crate::error::{LinkError, LinkResult};
use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Decode a hex string into bytes
///
/// Whitespace is ignored and both cases are accepted, so `"68 aa AA"` and
/// `"68AAAA"` decode to the same bytes.
pub fn hex_to_bytes(hex_str: &str) -> LinkResult<Vec<u8>> {
    let compact: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map_err(|e| LinkError::InvalidData(format!("Invalid hex string {:?}: {}", hex_str, e)))
}

/// Encode bytes as an uppercase hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Modulo-256 sum of all bytes (DL/T 645 check byte)
pub fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Modbus RTU CRC-16
pub fn modbus_crc16(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// Append the Modbus CRC-16 to a frame, low byte first
pub fn append_modbus_crc(frame: &mut Vec<u8>) {
    let crc = modbus_crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing Modbus CRC-16 of a complete RTU frame
///
/// Frames shorter than three bytes never verify.
pub fn verify_modbus_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    modbus_crc16(body).to_le_bytes() == [crc[0], crc[1]]
}
