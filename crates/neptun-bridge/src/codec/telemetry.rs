//! Decoding of inbound telemetry payloads
//!
//! A `system_state` (0x52) payload is a sequence of TLV records, one per
//! block of controller state. A `sensor_state` (0x53) payload is a 2-byte
//! prefix followed by packed 4-byte wireless sensor groups.
//!
//! Decoding is lenient: unknown tags are skipped, short blocks are ignored,
//! and a record that runs past the payload ends the walk while keeping
//! whatever was already decoded.

use serde::Serialize;
use tracing::{debug, trace};

use super::frame::RejectReason;
use super::tlv::TlvReader;
use super::types::{CounterSlot, LineConfig, StatusBits, LINE_COUNT};

/// Minimum size of the flags block
const FLAGS_BLOCK_LEN: usize = 7;

/// Wireless sensor group: signal, id, battery, leak
const SENSOR_GROUP_LEN: usize = 4;

/// Counter group: 4-byte BE value, 1-byte step
const COUNTER_GROUP_LEN: usize = 5;

/// Bytes skipped before the groups of a `sensor_state` payload
const SENSOR_STATE_PREFIX_LEN: usize = 2;

/// Known TLV tags of a `system_state` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTag {
    /// 0x49 'I' - device id string
    DeviceId,
    /// 0x4D 'M' - MAC string
    Mac,
    /// 0x41 'A' - cloud access flag
    Access,
    /// 0x53 'S' - flags block
    Flags,
    /// 0x73 's' - wireless sensors
    WirelessSensors,
    /// 0x4C 'L' - wired leak lines
    WiredLines,
    /// 0x43 'C' - counters
    Counters,
    /// 0x57 'W' - module signal level
    ModuleSignal,
    /// 0x44 'D' - device clock (ASCII epoch)
    DeviceTime,
    /// Undocumented tag
    Unknown(u8),
}

impl From<u8> for SystemTag {
    fn from(tag: u8) -> Self {
        match tag {
            0x49 => Self::DeviceId,
            0x4D => Self::Mac,
            0x41 => Self::Access,
            0x53 => Self::Flags,
            0x73 => Self::WirelessSensors,
            0x4C => Self::WiredLines,
            0x43 => Self::Counters,
            0x57 => Self::ModuleSignal,
            0x44 => Self::DeviceTime,
            other => Self::Unknown(other),
        }
    }
}

impl From<SystemTag> for u8 {
    fn from(tag: SystemTag) -> Self {
        match tag {
            SystemTag::DeviceId => 0x49,
            SystemTag::Mac => 0x4D,
            SystemTag::Access => 0x41,
            SystemTag::Flags => 0x53,
            SystemTag::WirelessSensors => 0x73,
            SystemTag::WiredLines => 0x4C,
            SystemTag::Counters => 0x43,
            SystemTag::ModuleSignal => 0x57,
            SystemTag::DeviceTime => 0x44,
            SystemTag::Unknown(tag) => tag,
        }
    }
}

/// Settings and status carried by the flags block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagsBlock {
    /// Main valve open
    pub valve_open: bool,
    /// Number of paired wireless sensors
    pub sensors_count: u8,
    /// Number of relay modules
    pub relay_count: u8,
    /// Dry (cleaning) mode
    pub dry_flag: bool,
    /// Close the valve when a sensor goes offline
    pub close_on_offline: bool,
    /// Line input types
    pub line_config: LineConfig,
    /// Raw status bits
    pub status: StatusBits,
    /// Label derived from `status`
    pub status_name: String,
}

impl FlagsBlock {
    fn decode(value: &[u8]) -> Option<Self> {
        if value.len() < FLAGS_BLOCK_LEN {
            return None;
        }
        let status = StatusBits::new(value[6]);
        Some(Self {
            valve_open: value[0] == 1,
            sensors_count: value[1],
            relay_count: value[2],
            dry_flag: value[3] == 1,
            close_on_offline: value[4] == 1,
            line_config: LineConfig::new(value[5]),
            status,
            status_name: status.label(),
        })
    }
}

/// One wireless sensor report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorReport {
    /// Sensor id (also its zone index)
    pub sensor_id: u8,
    /// Radio signal level
    pub signal_level: u8,
    /// Battery percentage
    pub battery_percent: u8,
    /// Raw leak byte
    pub leak_state: u8,
}

impl SensorReport {
    fn decode(group: &[u8]) -> Self {
        Self {
            signal_level: group[0],
            sensor_id: group[1],
            battery_percent: group[2],
            leak_state: group[3],
        }
    }

    /// Leak detected
    pub fn leak(&self) -> bool {
        self.leak_state != 0
    }
}

/// How the wired-line block was encoded on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WiredEncoding {
    /// Four bytes, one boolean per line
    PerLine,
    /// One byte, low 4 bits
    Bitmask,
}

/// Leak state of the wired lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WiredLines {
    /// Leak per line, index 0 is line 1
    pub states: [bool; LINE_COUNT],
    /// Encoding seen on the wire
    pub encoding: WiredEncoding,
}

impl WiredLines {
    fn decode(value: &[u8]) -> Option<Self> {
        if value.len() >= LINE_COUNT {
            Some(Self {
                states: [value[0] != 0, value[1] != 0, value[2] != 0, value[3] != 0],
                encoding: WiredEncoding::PerLine,
            })
        } else if let Some(&mask) = value.first() {
            Some(Self {
                states: [0, 1, 2, 3].map(|bit| (mask >> bit) & 1 == 1),
                encoding: WiredEncoding::Bitmask,
            })
        } else {
            None
        }
    }
}

/// Everything decoded from a `system_state` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemTelemetry {
    /// Device id / firmware string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// MAC reported by the device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Cloud access granted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<bool>,
    /// Settings and status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagsBlock>,
    /// Wireless sensors
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wireless_sensors: Vec<SensorReport>,
    /// Wired leak lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wired_lines: Option<WiredLines>,
    /// Counter readings, index 0 is line 1
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<CounterSlot>,
    /// Module radio level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_signal: Option<u8>,
    /// Device clock, epoch seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time: Option<i64>,
    /// Tags that were skipped
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_tags: Vec<u8>,
}

/// A decode result that may be partial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<T> {
    /// Fields decoded before any truncation
    pub value: T,
    /// Payload offset where decoding stopped early
    pub truncated_at: Option<usize>,
}

impl<T> Decoded<T> {
    /// True when the whole payload was consumed
    pub fn is_complete(&self) -> bool {
        self.truncated_at.is_none()
    }

    /// Rejection reason for a partial decode
    pub fn rejection(&self) -> Option<RejectReason> {
        self.truncated_at
            .map(|offset| RejectReason::Truncated { offset })
    }
}

fn ascii(value: &[u8]) -> String {
    value
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect()
}

/// Decode a `system_state` payload
pub fn decode_system_telemetry(payload: &[u8]) -> Decoded<SystemTelemetry> {
    let mut out = SystemTelemetry::default();
    let mut reader = TlvReader::new(payload);

    for record in reader.by_ref() {
        let value = record.value;
        match SystemTag::from(record.tag) {
            SystemTag::DeviceId => out.device_id = Some(ascii(value)),
            SystemTag::Mac => out.mac = Some(ascii(value)),
            SystemTag::Access => out.access = Some(value.first().is_some_and(|&b| b > 0)),
            SystemTag::Flags => match FlagsBlock::decode(value) {
                Some(flags) => out.flags = Some(flags),
                None => debug!(len = value.len(), "Ignoring short flags block"),
            },
            SystemTag::WirelessSensors => {
                out.wireless_sensors = value
                    .chunks_exact(SENSOR_GROUP_LEN)
                    .map(SensorReport::decode)
                    .collect();
            }
            SystemTag::WiredLines => {
                if let Some(lines) = WiredLines::decode(value) {
                    out.wired_lines = Some(lines);
                }
            }
            SystemTag::Counters => {
                out.counters = value
                    .chunks_exact(COUNTER_GROUP_LEN)
                    .map(|g| {
                        CounterSlot::new(u32::from_be_bytes([g[0], g[1], g[2], g[3]]), g[4])
                    })
                    .collect();
            }
            SystemTag::ModuleSignal => {
                if let Some(&level) = value.first() {
                    out.module_signal = Some(level);
                }
            }
            SystemTag::DeviceTime => {
                out.device_time = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok());
            }
            SystemTag::Unknown(tag) => {
                trace!(tag, len = value.len(), "Skipping unknown tag");
                out.unknown_tags.push(tag);
            }
        }
    }

    Decoded {
        value: out,
        truncated_at: reader.truncated_at(),
    }
}

/// Decode a `sensor_state` payload into its sensor groups
pub fn decode_sensor_telemetry(payload: &[u8]) -> Vec<SensorReport> {
    payload
        .get(SENSOR_STATE_PREFIX_LEN..)
        .unwrap_or_default()
        .chunks_exact(SENSOR_GROUP_LEN)
        .map(SensorReport::decode)
        .collect()
}
