use crate::error::{Result, WearlinkError};
use bytes::Bytes;
use std::fmt::UpperHex;

/// Checksum flavours used by fixed-header frame formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Low byte of the sum of all preceding bytes
    Sum,
    /// XOR of all preceding bytes
    Xor,
}

impl ChecksumKind {
    /// Compute the checksum byte over `data`
    #[must_use]
    pub fn compute(self, data: &[u8]) -> u8 {
        match self {
            Self::Sum => sum_checksum(data),
            Self::Xor => xor_checksum(data),
        }
    }
}

/// Compare the check value carried by a frame with the one computed over it
///
/// # Errors
///
/// Returns [`WearlinkError::ParseError`] when the two differ.
pub fn verify<T: PartialEq + UpperHex>(what: &str, received: T, expected: T) -> Result<()> {
    if received == expected {
        Ok(())
    } else {
        Err(WearlinkError::ParseError(format!(
            "{what} mismatch: got {received:X}, expected {expected:X}"
        )))
    }
}

/// Additive checksum, sum of bytes modulo 256
#[must_use]
pub fn sum_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// XOR checksum over all bytes
#[must_use]
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// CRC-16/MODBUS: reflected polynomial 0x8005, initial value 0xFFFF
#[must_use]
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Split `data` into slices of at most `mtu` bytes without copying
pub fn chunk(data: &Bytes, mtu: usize) -> impl Iterator<Item = Bytes> + '_ {
    let size = mtu.max(1);
    (0..data.len())
        .step_by(size)
        .map(move |start| data.slice(start..(start + size).min(data.len())))
}

/// Read a little-endian `u16` at `offset`
#[must_use]
pub fn u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian `u16` at `offset`
#[must_use]
pub fn u16_be(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `offset`
#[must_use]
pub fn u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse a hex string with an optional `0x` prefix
///
/// # Errors
///
/// Returns [`WearlinkError::InvalidParameters`] for odd-length input or non-hex digits.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(WearlinkError::InvalidParameters(format!(
            "Hex string must be ASCII with an even length: {input}"
        )));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| {
                WearlinkError::InvalidParameters(format!("Invalid hex byte in {input}"))
            })
        })
        .collect()
}

/// Parse a `XX:XX:XX:XX:XX:XX` Bluetooth address into bytes
///
/// # Errors
///
/// Returns [`WearlinkError::InvalidParameters`] if the address is malformed.
pub fn parse_mac(mac_address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac_address.split(':').collect();
    if parts.len() != 6 {
        return Err(WearlinkError::InvalidParameters(format!(
            "Invalid MAC address format: {mac_address}. Expected format: XX:XX:XX:XX:XX:XX"
        )));
    }

    let mut mac_bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac_bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
            WearlinkError::InvalidParameters(format!("Invalid MAC address byte: {part}"))
        })?;
    }

    Ok(mac_bytes)
}
