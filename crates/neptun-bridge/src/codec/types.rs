//! Value types shared by telemetry decoding, the device registry and
//! command composition.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NeptunError, Result};

/// Number of wired input lines on a controller
pub const LINE_COUNT: usize = 4;

/// A wired input line, numbered 1 to 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LineIndex(u8);

impl LineIndex {
    /// Create a line index, rejecting anything outside 1..=4
    pub fn new(number: u8) -> Result<Self> {
        if (1..=LINE_COUNT as u8).contains(&number) {
            Ok(Self(number))
        } else {
            Err(NeptunError::InvalidParameter(format!(
                "line {} out of range 1..={}",
                number, LINE_COUNT
            )))
        }
    }

    /// All four lines in order
    pub fn all() -> [LineIndex; LINE_COUNT] {
        [Self(1), Self(2), Self(3), Self(4)]
    }

    /// Line number as printed on the controller (1-based)
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based slot used for arrays
    pub fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// Bit of this line inside [`LineConfig`]
    pub fn bit(self) -> u8 {
        1 << (self.0 - 1)
    }
}

impl TryFrom<u8> for LineIndex {
    type Error = NeptunError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LineIndex> for u8 {
    fn from(line: LineIndex) -> Self {
        line.0
    }
}

impl fmt::Display for LineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line_{}", self.0)
    }
}

/// What a wired line is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    /// Leak sensor input (bit cleared)
    Sensor,
    /// Pulse counter input (bit set)
    Counter,
}

impl LineKind {
    /// Label used on the bus
    pub fn as_str(self) -> &'static str {
        match self {
            LineKind::Sensor => "sensor",
            LineKind::Counter => "counter",
        }
    }
}

/// 4-bit mask of line input types; bit `n-1` set means line `n` is a counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineConfig(u8);

impl LineConfig {
    /// Build from a raw byte, keeping only the low 4 bits
    pub fn new(mask: u8) -> Self {
        Self(mask & 0x0F)
    }

    /// Raw 4-bit mask
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Input type of one line
    pub fn kind(self, line: LineIndex) -> LineKind {
        if self.0 & line.bit() != 0 {
            LineKind::Counter
        } else {
            LineKind::Sensor
        }
    }

    /// Copy with exactly one line changed
    pub fn with(self, line: LineIndex, kind: LineKind) -> Self {
        match kind {
            LineKind::Counter => Self(self.0 | line.bit()),
            LineKind::Sensor => Self(self.0 & !line.bit() & 0x0F),
        }
    }
}

/// Raw counter reading of one line: cumulative value and litres per pulse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSlot {
    /// Cumulative value (litres)
    pub value: u32,
    /// Step (litres per pulse)
    pub step: u8,
}

impl CounterSlot {
    /// Create a counter slot
    pub fn new(value: u32, step: u8) -> Self {
        Self { value, step }
    }

    /// Copy suitable for writing back: the device rejects a zero step
    pub fn writable(self) -> Self {
        Self {
            value: self.value,
            step: self.step.max(1),
        }
    }
}

/// Status byte of the flags block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusBits(u8);

impl StatusBits {
    const ALARM: u8 = 0x01;
    const MAIN_BATTERY: u8 = 0x02;
    const SENSOR_BATTERY: u8 = 0x04;
    const SENSOR_OFFLINE: u8 = 0x08;

    /// Wrap a raw status byte
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Leak alarm raised
    pub fn alarm(self) -> bool {
        self.0 & Self::ALARM != 0
    }

    /// Controller battery low
    pub fn main_battery(self) -> bool {
        self.0 & Self::MAIN_BATTERY != 0
    }

    /// A wireless sensor battery is low
    pub fn sensor_battery(self) -> bool {
        self.0 & Self::SENSOR_BATTERY != 0
    }

    /// A wireless sensor stopped reporting
    pub fn sensor_offline(self) -> bool {
        self.0 & Self::SENSOR_OFFLINE != 0
    }

    /// Comma-joined label, `normal` when no bit is set
    pub fn label(self) -> String {
        let names: Vec<&str> = [
            (self.alarm(), "alarm"),
            (self.main_battery(), "main-battery"),
            (self.sensor_battery(), "sensor-battery"),
            (self.sensor_offline(), "sensor-offline"),
        ]
        .iter()
        .filter_map(|&(set, name)| set.then_some(name))
        .collect();

        if names.is_empty() {
            "normal".to_string()
        } else {
            names.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index_bounds() {
        assert!(LineIndex::new(0).is_err());
        assert!(LineIndex::new(5).is_err());
        let line = LineIndex::new(3).unwrap();
        assert_eq!(line.bit(), 0b0100);
        assert_eq!(line.slot(), 2);
        assert_eq!(line.to_string(), "line_3");
    }

    #[test]
    fn test_line_bit_toggling() {
        let line3 = LineIndex::new(3).unwrap();
        let cfg = LineConfig::new(0b0000).with(line3, LineKind::Counter);
        assert_eq!(cfg.bits(), 0b0100);
        assert_eq!(cfg.kind(line3), LineKind::Counter);

        let cfg = cfg.with(line3, LineKind::Sensor);
        assert_eq!(cfg.bits(), 0b0000);
    }

    #[test]
    fn test_line_config_touches_one_bit() {
        let line2 = LineIndex::new(2).unwrap();
        let cfg = LineConfig::new(0b1001).with(line2, LineKind::Counter);
        assert_eq!(cfg.bits(), 0b1011);
    }

    #[test]
    fn test_line_config_masks_high_bits() {
        assert_eq!(LineConfig::new(0xF5).bits(), 0x05);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(StatusBits::new(0).label(), "normal");
        assert_eq!(StatusBits::new(0x01).label(), "alarm");
        assert_eq!(StatusBits::new(0x0A).label(), "main-battery,sensor-offline");
        assert!(StatusBits::new(0x04).sensor_battery());
    }

    #[test]
    fn test_counter_slot_writable_step() {
        assert_eq!(CounterSlot::new(10, 0).writable().step, 1);
        assert_eq!(CounterSlot::new(10, 10).writable().step, 10);
    }
}
