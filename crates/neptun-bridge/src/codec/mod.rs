//! Neptun binary frame codec
//!
//! Every frame exchanged with the Neptun cloud shares one envelope:
//!
//! ```text
//! ┌───────────┬────────┬──────┬─────────┬─────────────┬──────────┐
//! │ 0x02 0x54 │ marker │ type │ len(BE) │ TLV payload │ CRC16 BE │
//! │  2 bytes  │ 1 byte │ 1 b. │ 2 bytes │  len bytes  │ 2 bytes  │
//! └───────────┴────────┴──────┴─────────┴─────────────┴──────────┘
//! ```
//!
//! - [`crc`] - CRC16-CCITT used for the trailer
//! - [`frame`] - envelope validation and construction
//! - [`tlv`] - tag/length/value walking and encoding
//! - [`telemetry`] - decoding of `system_state` and `sensor_state` payloads
//! - [`command`] - encoding of outbound settings, counter and clock commands
//!
//! None of these functions panic or return an error for malformed device
//! input: validation yields a [`RejectReason`], and telemetry decoding yields
//! a partial record flagged as truncated.

pub mod command;
pub mod crc;
pub mod frame;
pub mod telemetry;
pub mod tlv;
pub mod types;

pub use command::{Command, CommandKind, SettingsPayload};
pub use crc::crc16_ccitt;
pub use frame::{
    Frame, FrameType, RejectReason, BRIDGE_SOURCE_MARKER, CRC_LEN, FRAME_SIGNATURE, HEADER_LEN,
    MIN_FRAME_LEN,
};
pub use telemetry::{
    decode_sensor_telemetry, decode_system_telemetry, Decoded, FlagsBlock, SensorReport,
    SystemTag, SystemTelemetry, WiredEncoding, WiredLines,
};
pub use tlv::{encode_records, parse_records, TlvReader, TlvRecord};
pub use types::{CounterSlot, LineConfig, LineIndex, LineKind, StatusBits, LINE_COUNT};
