//! Register-read request framing for the temperature bus.
//!
//! Requests are `[unit, function, start_hi, start_lo, count_hi, count_lo]`
//! followed by a CRC-16 (poly `0xA001`, init `0xFFFF`) sent low byte first.
//! Responses echo unit and function, carry a byte count and big-endian
//! register payload, and end with the same checksum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const EXCEPTION_FLAG: u8 = 0x80;
pub const REQUEST_LEN: usize = 8;
pub const CRC_LEN: usize = 2;
/// Registers one response can carry behind its one-byte byte count.
pub const MAX_RESPONSE_REGISTERS: usize = u8::MAX as usize / 2;
/// Exception code a unit returns for a register count it cannot serve.
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;
const MIN_RESPONSE_LEN: usize = 5;
const HEADER_LEN: usize = 3; // unit + function + byte count

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("response too short: {len} bytes")]
    ShortResponse { len: usize },
    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("unit mismatch: expected {expected}, received {received}")]
    UnitMismatch { expected: u8, received: u8 },
    #[error("function mismatch: expected {expected:#04x}, received {received:#04x}")]
    FunctionMismatch { expected: u8, received: u8 },
    #[error("byte count mismatch: expected {expected}, received {received}")]
    ByteCountMismatch { expected: usize, received: usize },
    #[error("device exception code {0:#04x}")]
    DeviceException(u8),
    #[error("{0} registers do not fit one response")]
    TooManyRegisters(usize),
}

/// Bit-serial CRC-16 over every byte, LSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checksum bytes in wire order (low byte first).
pub fn checksum(data: &[u8]) -> [u8; CRC_LEN] {
    crc16(data).to_le_bytes()
}

/// True when the trailing two bytes of `frame` are the checksum of the rest.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < CRC_LEN {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - CRC_LEN);
    checksum(body) == [tail[0], tail[1]]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub unit_id: u8,
    pub function_code: u8,
    pub start_address: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn holding_registers(unit_id: u8, start_address: u16, count: u16) -> Self {
        Self {
            unit_id,
            function_code: READ_HOLDING_REGISTERS,
            start_address,
            count,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let start = self.start_address.to_be_bytes();
        let count = self.count.to_be_bytes();
        let mut frame = [
            self.unit_id,
            self.function_code,
            start[0],
            start[1],
            count[0],
            count[1],
            0,
            0,
        ];
        let crc = checksum(&frame[..REQUEST_LEN - CRC_LEN]);
        frame[REQUEST_LEN - CRC_LEN..].copy_from_slice(&crc);
        frame
    }

    /// Parses a request frame as a unit on the bus would see it.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != REQUEST_LEN {
            return Err(FrameError::ShortResponse { len: frame.len() });
        }
        if !verify(frame) {
            let (body, tail) = frame.split_at(REQUEST_LEN - CRC_LEN);
            return Err(FrameError::ChecksumMismatch {
                computed: crc16(body),
                received: u16::from_le_bytes([tail[0], tail[1]]),
            });
        }
        Ok(Self {
            unit_id: frame[0],
            function_code: frame[1],
            start_address: u16::from_be_bytes([frame[2], frame[3]]),
            count: u16::from_be_bytes([frame[4], frame[5]]),
        })
    }

    /// Length of a well-formed, non-exception response to this request.
    pub fn expected_response_len(&self) -> usize {
        HEADER_LEN + usize::from(self.count) * 2 + CRC_LEN
    }

    /// Validates `frame` against this request and decodes its registers.
    pub fn decode_response(&self, frame: &[u8]) -> Result<Vec<i16>, FrameError> {
        if frame.len() < MIN_RESPONSE_LEN {
            return Err(FrameError::ShortResponse { len: frame.len() });
        }

        let (body, tail) = frame.split_at(frame.len() - CRC_LEN);
        let computed = crc16(body);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        if computed != received {
            return Err(FrameError::ChecksumMismatch { computed, received });
        }

        if body[0] != self.unit_id {
            return Err(FrameError::UnitMismatch {
                expected: self.unit_id,
                received: body[0],
            });
        }

        let function = body[1];
        if function & EXCEPTION_FLAG != 0 {
            if function & !EXCEPTION_FLAG != self.function_code {
                return Err(FrameError::FunctionMismatch {
                    expected: self.function_code,
                    received: function,
                });
            }
            return Err(FrameError::DeviceException(body[2]));
        }
        if function != self.function_code {
            return Err(FrameError::FunctionMismatch {
                expected: self.function_code,
                received: function,
            });
        }

        let expected = usize::from(self.count) * 2;
        let byte_count = usize::from(body[2]);
        if byte_count != expected {
            return Err(FrameError::ByteCountMismatch {
                expected,
                received: byte_count,
            });
        }
        let payload = &body[HEADER_LEN..];
        if payload.len() != byte_count {
            return Err(FrameError::ByteCountMismatch {
                expected,
                received: payload.len(),
            });
        }

        Ok(payload
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Builds a response frame for `request` carrying `registers`.
///
/// Used by the simulated pack and by tests; the supervisor itself only
/// ever decodes responses.
pub fn encode_response(request: &ReadRequest, registers: &[i16]) -> Result<Vec<u8>, FrameError> {
    let byte_count = u8::try_from(registers.len() * 2)
        .map_err(|_| FrameError::TooManyRegisters(registers.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + registers.len() * 2 + CRC_LEN);
    frame.push(request.unit_id);
    frame.push(request.function_code);
    frame.push(byte_count);
    for value in registers {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc);
    Ok(frame)
}

/// Builds an exception response carrying `code`.
pub fn encode_exception(request: &ReadRequest, code: u8) -> Vec<u8> {
    let mut frame = vec![request.unit_id, request.function_code | EXCEPTION_FLAG, code];
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc);
    frame
}
