//! Frame envelope: validation of inbound buffers and construction of
//! outbound frames.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::crc::crc16_ccitt;
use crate::error::{NeptunError, Result};

/// Fixed first two bytes of every frame
pub const FRAME_SIGNATURE: [u8; 2] = [0x02, 0x54];

/// Source marker this bridge writes into byte 2 of outbound frames (`'Q'`)
pub const BRIDGE_SOURCE_MARKER: u8 = 0x51;

/// Signature + marker + type + length
pub const HEADER_LEN: usize = 6;

/// Trailing checksum length
pub const CRC_LEN: usize = 2;

/// Smallest possible frame (empty payload)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;

/// Why a buffer was not accepted as a frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Too short, or the first two bytes are not the signature
    #[error("bad signature")]
    BadSignature,

    /// Declared payload length disagrees with the buffer length
    #[error("length mismatch: declared payload {declared} bytes, frame has {actual} bytes")]
    LengthMismatch {
        /// Payload length from bytes 4-5
        declared: usize,
        /// Total buffer length
        actual: usize,
    },

    /// Trailer does not match the computed checksum
    #[error("crc mismatch: computed 0x{computed:04X}, trailer 0x{received:04X}")]
    CrcMismatch {
        /// CRC16 over the buffer minus trailer
        computed: u16,
        /// Big-endian trailer value
        received: u16,
    },

    /// A TLV record ran past the end of the payload
    #[error("payload truncated at offset {offset}")]
    Truncated {
        /// Payload offset of the record that could not be read
        offset: usize,
    },
}

impl RejectReason {
    /// Stable code for logs
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::BadSignature => "BAD_SIGNATURE",
            RejectReason::LengthMismatch { .. } => "LENGTH_MISMATCH",
            RejectReason::CrcMismatch { .. } => "CRC_MISMATCH",
            RejectReason::Truncated { .. } => "TRUNCATED",
        }
    }
}

/// Frame type code (byte 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// 0x52 - full controller state
    SystemState,
    /// 0x53 - wireless sensor state
    SensorState,
    /// 0x43 - counter state
    CounterState,
    /// 0x4E - wireless sensor names
    SensorName,
    /// 0x63 - counter names
    CounterName,
    /// 0xFB - acknowledgement
    Ack,
    /// 0xFE - controller busy
    Busy,
    /// 0x57 - settings / command
    Command,
    /// Anything undocumented, kept for diagnostics
    Unknown(u8),
}

impl FrameType {
    /// Name used in logs and diagnostic topics
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::SystemState => "system_state",
            FrameType::SensorState => "sensor_state",
            FrameType::CounterState => "counter_state",
            FrameType::SensorName => "sensor_name",
            FrameType::CounterName => "counter_name",
            FrameType::Ack => "ack",
            FrameType::Busy => "busy",
            FrameType::Command => "command",
            FrameType::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for FrameType {
    fn from(code: u8) -> Self {
        match code {
            0x52 => Self::SystemState,
            0x53 => Self::SensorState,
            0x43 => Self::CounterState,
            0x4E => Self::SensorName,
            0x63 => Self::CounterName,
            0xFB => Self::Ack,
            0xFE => Self::Busy,
            0x57 => Self::Command,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        match frame_type {
            FrameType::SystemState => 0x52,
            FrameType::SensorState => 0x53,
            FrameType::CounterState => 0x43,
            FrameType::SensorName => 0x4E,
            FrameType::CounterName => 0x63,
            FrameType::Ack => 0xFB,
            FrameType::Busy => 0xFE,
            FrameType::Command => 0x57,
            FrameType::Unknown(code) => code,
        }
    }
}

/// A validated frame. The buffer is immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Validate a raw buffer
    ///
    /// Checks, in order: minimum length and signature, declared length
    /// against actual length, then the CRC trailer.
    pub fn validate(buf: &[u8]) -> std::result::Result<Frame, RejectReason> {
        if buf.len() < MIN_FRAME_LEN || buf[..2] != FRAME_SIGNATURE {
            return Err(RejectReason::BadSignature);
        }

        let declared = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
        if buf.len() != HEADER_LEN + declared + CRC_LEN {
            return Err(RejectReason::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        let split = buf.len() - CRC_LEN;
        let computed = crc16_ccitt(&buf[..split]);
        let received = u16::from_be_bytes([buf[split], buf[split + 1]]);
        if computed != received {
            return Err(RejectReason::CrcMismatch { computed, received });
        }

        Ok(Frame {
            bytes: Bytes::copy_from_slice(buf),
        })
    }

    /// Build a frame from its parts, computing length and CRC
    pub fn build(source_marker: u8, frame_type: FrameType, payload: &[u8]) -> Result<Frame> {
        let length = u16::try_from(payload.len()).map_err(|_| {
            NeptunError::InvalidParameter(format!(
                "payload of {} bytes does not fit a frame",
                payload.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + payload.len());
        buf.put_slice(&FRAME_SIGNATURE);
        buf.put_u8(source_marker);
        buf.put_u8(frame_type.into());
        buf.put_u16(length);
        buf.put_slice(payload);
        let crc = crc16_ccitt(&buf);
        buf.put_u16(crc);

        Ok(Frame {
            bytes: buf.freeze(),
        })
    }

    /// Byte 2
    pub fn source_marker(&self) -> u8 {
        self.bytes[2]
    }

    /// Byte 3, decoded
    pub fn frame_type(&self) -> FrameType {
        FrameType::from(self.bytes[3])
    }

    /// TLV payload between header and trailer
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - CRC_LEN]
    }

    /// Trailer value
    pub fn checksum(&self) -> u16 {
        let split = self.bytes.len() - CRC_LEN;
        u16::from_be_bytes([self.bytes[split], self.bytes[split + 1]])
    }

    /// Full wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the wire bytes
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a frame has at least a header and trailer
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercase hex dump
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:02X}) {} bytes",
            self.frame_type().name(),
            u8::from(self.frame_type()),
            self.len()
        )
    }
}
