//! Outbound command frames
//!
//! All commands travel in a `0x57` frame with the bridge source marker and
//! a single TLV record:
//!
//! | Kind         | Tag  | Value                                          |
//! |--------------|------|------------------------------------------------|
//! | Settings     | 0x53 | `[valve, dry, close_on_offline, line_config]`  |
//! | CounterWrite | 0x43 | 4 × `[value u32 BE, step u8]` (20 bytes)       |
//! | TimeSet      | 0x44 | ASCII `DD/MM/YYYY,HH:MM:SS`                    |

use chrono::{DateTime, Local, TimeZone, Utc};
use std::fmt;

use super::frame::{Frame, FrameType, BRIDGE_SOURCE_MARKER};
use super::tlv::{put_record, TlvReader};
use super::types::{CounterSlot, LineConfig, LINE_COUNT};
use crate::error::{NeptunError, Result};

const SETTINGS_LEN: usize = 4;
const COUNTER_BLOCK_LEN: usize = LINE_COUNT * 5;
const TIME_FORMAT: &str = "%d/%m/%Y,%H:%M:%S";

/// Kind of command, identified by its TLV tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Valve, flags and line types
    Settings,
    /// Counter values and steps
    CounterWrite,
    /// Device clock
    TimeSet,
}

impl CommandKind {
    /// TLV tag of this command
    pub fn tag(self) -> u8 {
        match self {
            CommandKind::Settings => 0x53,
            CommandKind::CounterWrite => 0x43,
            CommandKind::TimeSet => 0x44,
        }
    }

    /// Look up a command by tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x53 => Some(CommandKind::Settings),
            0x43 => Some(CommandKind::CounterWrite),
            0x44 => Some(CommandKind::TimeSet),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Settings => write!(f, "settings"),
            CommandKind::CounterWrite => write!(f, "counter_write"),
            CommandKind::TimeSet => write!(f, "time_set"),
        }
    }
}

/// The complete settings block; the device has no partial-update command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsPayload {
    /// Valve open
    pub valve_open: bool,
    /// Dry mode
    pub dry_flag: bool,
    /// Close valve on sensor loss
    pub close_on_offline: bool,
    /// Line input types
    pub line_config: LineConfig,
}

/// A command ready to be encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write all settings
    Settings(SettingsPayload),
    /// Write all four counters
    CounterWrite([CounterSlot; LINE_COUNT]),
    /// Set the device clock; the string is already formatted
    TimeSet(String),
}

impl Command {
    /// Clock command for `epoch` in the local time zone; negative epochs clamp to 0
    pub fn time_set(epoch: i64) -> Self {
        Self::time_set_in(epoch, &Local)
    }

    /// Clock command for `epoch` rendered in `tz`
    pub fn time_set_in<Tz>(epoch: i64, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let utc: DateTime<Utc> = DateTime::from_timestamp(epoch.max(0), 0).unwrap_or_default();
        Command::TimeSet(utc.with_timezone(tz).format(TIME_FORMAT).to_string())
    }

    /// Kind of this command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Settings(_) => CommandKind::Settings,
            Command::CounterWrite(_) => CommandKind::CounterWrite,
            Command::TimeSet(_) => CommandKind::TimeSet,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Command::Settings(s) => vec![
                u8::from(s.valve_open),
                u8::from(s.dry_flag),
                u8::from(s.close_on_offline),
                s.line_config.bits(),
            ],
            Command::CounterWrite(slots) => {
                let mut out = Vec::with_capacity(COUNTER_BLOCK_LEN);
                for slot in slots {
                    out.extend_from_slice(&slot.value.to_be_bytes());
                    out.push(slot.step);
                }
                out
            }
            Command::TimeSet(text) => text.as_bytes().to_vec(),
        }
    }

    /// Encode into a complete frame
    pub fn encode(&self) -> Result<Frame> {
        let mut payload = Vec::new();
        put_record(&mut payload, self.kind().tag(), &self.value())?;
        Frame::build(BRIDGE_SOURCE_MARKER, FrameType::Command, &payload)
    }

    /// Parse a command frame back into a command
    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.frame_type() != FrameType::Command {
            return Err(NeptunError::UnexpectedFrameType {
                expected: FrameType::Command.into(),
                got: frame.frame_type().into(),
            });
        }

        let record = TlvReader::new(frame.payload())
            .next()
            .ok_or_else(|| NeptunError::MalformedCommand("empty payload".to_string()))?;
        let kind = CommandKind::from_tag(record.tag).ok_or_else(|| {
            NeptunError::MalformedCommand(format!("unknown command tag 0x{:02X}", record.tag))
        })?;
        let value = record.value;

        match kind {
            CommandKind::Settings => {
                if value.len() != SETTINGS_LEN {
                    return Err(NeptunError::MalformedCommand(format!(
                        "settings value is {} bytes",
                        value.len()
                    )));
                }
                Ok(Command::Settings(SettingsPayload {
                    valve_open: value[0] == 1,
                    dry_flag: value[1] == 1,
                    close_on_offline: value[2] == 1,
                    line_config: LineConfig::new(value[3]),
                }))
            }
            CommandKind::CounterWrite => {
                if value.len() != COUNTER_BLOCK_LEN {
                    return Err(NeptunError::MalformedCommand(format!(
                        "counter value is {} bytes",
                        value.len()
                    )));
                }
                let mut slots = [CounterSlot::default(); LINE_COUNT];
                for (slot, group) in slots.iter_mut().zip(value.chunks_exact(5)) {
                    *slot = CounterSlot::new(
                        u32::from_be_bytes([group[0], group[1], group[2], group[3]]),
                        group[4],
                    );
                }
                Ok(Command::CounterWrite(slots))
            }
            CommandKind::TimeSet => std::str::from_utf8(value)
                .map(|s| Command::TimeSet(s.to_string()))
                .map_err(|e| NeptunError::MalformedCommand(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc16_ccitt;

    #[test]
    fn test_settings_frame_layout() {
        let frame = Command::Settings(SettingsPayload {
            valve_open: true,
            dry_flag: false,
            close_on_offline: true,
            line_config: LineConfig::new(0b0011),
        })
        .encode()
        .unwrap();

        let bytes = frame.as_bytes();
        assert_eq!(
            &bytes[..13],
            &[0x02, 0x54, 0x51, 0x57, 0x00, 0x07, 0x53, 0x00, 0x04, 0x01, 0x00, 0x01, 0x03]
        );
        assert_eq!(
            u16::from_be_bytes([bytes[13], bytes[14]]),
            crc16_ccitt(&bytes[..13])
        );
    }

    #[test]
    fn test_counter_write_always_four_lines() {
        let slots = [
            CounterSlot::new(100, 1),
            CounterSlot::new(0x0102_0304, 10),
            CounterSlot::new(0, 1),
            CounterSlot::new(u32::MAX, 255),
        ];
        let frame = Command::CounterWrite(slots).encode().unwrap();
        let payload = frame.payload();
        assert_eq!(&payload[..3], &[0x43, 0x00, 20]);
        assert_eq!(&payload[8..13], &[0x01, 0x02, 0x03, 0x04, 10]);

        assert_eq!(
            Command::decode(&frame).unwrap(),
            Command::CounterWrite(slots)
        );
    }

    #[test]
    fn test_time_set_format() {
        let cmd = Command::time_set_in(1_700_000_000, &Utc);
        assert_eq!(cmd, Command::TimeSet("14/11/2023,22:13:20".to_string()));

        let frame = cmd.encode().unwrap();
        assert_eq!(&frame.payload()[..3], &[0x44, 0x00, 19]);
        assert_eq!(&frame.payload()[3..], b"14/11/2023,22:13:20");
    }

    #[test]
    fn test_time_set_negative_epoch_clamps() {
        assert_eq!(
            Command::time_set_in(-5, &Utc),
            Command::TimeSet("01/01/1970,00:00:00".to_string())
        );
    }

    #[test]
    fn test_time_set_local_matches_chrono() {
        let expected = Local
            .timestamp_opt(86_400, 0)
            .earliest()
            .unwrap()
            .format(TIME_FORMAT)
            .to_string();
        assert_eq!(Command::time_set(86_400), Command::TimeSet(expected));
    }

    #[test]
    fn test_decode_rejects_telemetry_frame() {
        let frame = Frame::build(0x41, FrameType::SystemState, &[]).unwrap();
        assert!(matches!(
            Command::decode(&frame),
            Err(NeptunError::UnexpectedFrameType { got: 0x52, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_settings() {
        let frame =
            Frame::build(BRIDGE_SOURCE_MARKER, FrameType::Command, &[0x53, 0x00, 0x02, 1, 0])
                .unwrap();
        assert!(matches!(
            Command::decode(&frame),
            Err(NeptunError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_kind_tags() {
        for kind in [
            CommandKind::Settings,
            CommandKind::CounterWrite,
            CommandKind::TimeSet,
        ] {
            assert_eq!(CommandKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(CommandKind::from_tag(0x99), None);
    }
}
