//! Command composition
//!
//! The controller only accepts complete command blocks: a settings frame
//! always carries valve, dry mode, close-on-offline and all four line
//! types, and a counter frame always carries all four lines. The composer
//! reads the device's effective snapshot, applies exactly one requested
//! change and encodes the result, so a single-field request never disturbs
//! the other fields. The change is written to the registry as speculative
//! under the same entry lock, so back-to-back requests build on each other.
//!
//! Destination resolution, first match wins:
//!
//! 1. a per-device static destination
//! 2. the global cloud prefix
//! 3. the channel learned from the device's most recent inbound frame

use chrono::{Local, TimeZone};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{
    Command, CounterSlot, Frame, LineIndex, LineKind, SettingsPayload, LINE_COUNT,
};
use crate::config::NeptunConfig;
use crate::error::{NeptunError, Result};
use crate::registry::{DeviceId, DeviceRegistry, Field, FieldValue};

/// One requested settings change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    /// Open (true) or close the valve
    Valve(bool),
    /// Dry mode on/off
    DryFlag(bool),
    /// Close valve on sensor loss on/off
    CloseOnOffline(bool),
    /// Switch one wired line between sensor and counter
    LineType {
        /// Line to change
        line: LineIndex,
        /// New input type
        kind: LineKind,
    },
}

impl SettingsChange {
    /// Line-type change from a raw line number, rejecting anything outside 1..=4
    pub fn line_type(number: u8, kind: LineKind) -> Result<Self> {
        Ok(SettingsChange::LineType {
            line: LineIndex::new(number)?,
            kind,
        })
    }

    /// Field this change drives
    pub fn field(&self) -> Field {
        match self {
            SettingsChange::Valve(_) => Field::Valve,
            SettingsChange::DryFlag(_) => Field::DryFlag,
            SettingsChange::CloseOnOffline(_) => Field::CloseOnOffline,
            SettingsChange::LineType { line, .. } => Field::LineType(*line),
        }
    }

    /// Desired value of [`SettingsChange::field`]
    pub fn desired(&self) -> FieldValue {
        match self {
            SettingsChange::Valve(v)
            | SettingsChange::DryFlag(v)
            | SettingsChange::CloseOnOffline(v) => FieldValue::Flag(*v),
            SettingsChange::LineType { kind, .. } => FieldValue::Line(*kind),
        }
    }

    /// Settings with this one change applied
    pub fn apply(&self, mut settings: SettingsPayload) -> SettingsPayload {
        match *self {
            SettingsChange::Valve(v) => settings.valve_open = v,
            SettingsChange::DryFlag(v) => settings.dry_flag = v,
            SettingsChange::CloseOnOffline(v) => settings.close_on_offline = v,
            SettingsChange::LineType { line, kind } => {
                settings.line_config = settings.line_config.with(line, kind)
            }
        }
        settings
    }
}

/// Requested update of one counter line; `None` keeps the cached part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Line to update
    pub line: LineIndex,
    /// New value; floored at 0 and capped at `u32::MAX`
    pub value: Option<i64>,
    /// New step; must be 1..=255
    pub step: Option<i64>,
}

impl CounterUpdate {
    /// Update only the value of a line
    pub fn value(line: LineIndex, value: i64) -> Self {
        Self {
            line,
            value: Some(value),
            step: None,
        }
    }

    /// Update only the step of a line
    pub fn step(line: LineIndex, step: i64) -> Self {
        Self {
            line,
            value: None,
            step: Some(step),
        }
    }

    fn apply(&self, cached: CounterSlot) -> Result<CounterSlot> {
        let step = match self.step {
            Some(step) => u8::try_from(step)
                .ok()
                .filter(|&s| s >= 1)
                .ok_or_else(|| {
                    NeptunError::InvalidParameter(format!(
                        "step {} for {} out of range 1..=255",
                        step, self.line
                    ))
                })?,
            None => cached.step.max(1),
        };
        let value = match self.value {
            Some(value) => value.clamp(0, i64::from(u32::MAX)) as u32,
            None => cached.value,
        };
        Ok(CounterSlot::new(value, step))
    }
}

/// The request a tracked command was built from, kept so resends can be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    /// One settings field
    Settings(SettingsChange),
    /// Counter lines, applied in order
    Counters(Vec<CounterUpdate>),
}

/// A command ready for the transport, with what the device should report back
#[derive(Debug, Clone)]
pub struct ComposedCommand {
    /// Target device
    pub device: DeviceId,
    /// Outbound channel
    pub destination: String,
    /// Command before encoding
    pub command: Command,
    /// Encoded frame
    pub frame: Frame,
    /// Field and value that confirm the command; `None` for fire-and-forget
    pub expectation: Option<(Field, FieldValue)>,
    /// Request behind a tracked command
    pub change: Option<PendingChange>,
}

impl fmt::Display for ComposedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{}",
            self.command.kind(),
            self.destination,
            self.device
        )
    }
}

/// Builds complete command frames from registry snapshots
#[derive(Debug, Clone)]
pub struct CommandComposer {
    registry: DeviceRegistry,
    destinations: Arc<HashMap<DeviceId, String>>,
    cloud_prefix: Option<String>,
}

impl CommandComposer {
    /// Create with no static destinations
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            destinations: Arc::new(HashMap::new()),
            cloud_prefix: None,
        }
    }

    /// Create from configuration
    pub fn from_config(registry: DeviceRegistry, config: &NeptunConfig) -> Self {
        let destinations = config
            .destinations
            .iter()
            .map(|(device, channel)| (DeviceId::new(device.as_str()), channel.clone()))
            .collect();
        Self {
            registry,
            destinations: Arc::new(destinations),
            cloud_prefix: config.topics.cloud_prefix.clone(),
        }
    }

    /// Set the global cloud prefix
    pub fn with_cloud_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cloud_prefix = Some(prefix.into());
        self
    }

    /// Add a per-device static destination
    pub fn with_destination(mut self, device: DeviceId, channel: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.destinations).insert(device, channel.into());
        self
    }

    /// Registry this composer reads from
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Outbound channel for a device
    pub fn resolve_destination(&self, device: &DeviceId) -> Result<String> {
        self.destinations
            .get(device)
            .cloned()
            .or_else(|| self.cloud_prefix.clone())
            .or_else(|| self.registry.channel(device))
            .ok_or_else(|| NeptunError::DestinationUnknown {
                device: device.to_string(),
            })
    }

    /// Settings frame with exactly one field changed
    pub fn compose_settings(
        &self,
        device: &DeviceId,
        change: SettingsChange,
    ) -> Result<ComposedCommand> {
        let destination = self.resolve_destination(device)?;
        let command = self.registry.compose_speculative(device, |snapshot| {
            let expectation = (change.field(), change.desired());
            let command = Command::Settings(change.apply(snapshot.settings()));
            Ok((command, Some(expectation)))
        })?;

        debug!(device = %device, ?change, "Composed settings command");
        self.finish(
            device,
            destination,
            command,
            Some((change.field(), change.desired())),
            Some(PendingChange::Settings(change)),
        )
    }

    /// Counter frame with the requested lines updated and the others as cached
    pub fn compose_counter_write(
        &self,
        device: &DeviceId,
        updates: &[CounterUpdate],
    ) -> Result<ComposedCommand> {
        if updates.is_empty() {
            return Err(NeptunError::InvalidParameter(
                "counter write without any line".to_string(),
            ));
        }

        let destination = self.resolve_destination(device)?;
        let (slots, requested) = self.registry.compose_speculative(device, |snapshot| {
            let (slots, requested) = apply_counter_updates(snapshot.counters, updates)?;
            let expectation = (Field::Counters, FieldValue::Counters(requested.clone()));
            Ok(((slots, requested), Some(expectation)))
        })?;

        debug!(device = %device, lines = requested.len(), "Composed counter write");
        self.finish(
            device,
            destination,
            Command::CounterWrite(slots),
            Some((Field::Counters, FieldValue::Counters(requested))),
            Some(PendingChange::Counters(updates.to_vec())),
        )
    }

    /// Frame for a resend: the current effective snapshot with `changes`
    /// applied in order
    ///
    /// Settings changes are folded into one settings block; counter updates
    /// into one counter block. The registry is not written.
    pub fn rebuild<'a>(
        &self,
        device: &DeviceId,
        changes: impl IntoIterator<Item = &'a PendingChange>,
    ) -> Result<Frame> {
        let snapshot = self.registry.get(device);
        let mut settings = snapshot.settings();
        let mut counters: Vec<CounterUpdate> = Vec::new();
        for change in changes {
            match change {
                PendingChange::Settings(change) => settings = change.apply(settings),
                PendingChange::Counters(updates) => counters.extend_from_slice(updates),
            }
        }

        let command = if counters.is_empty() {
            Command::Settings(settings)
        } else {
            Command::CounterWrite(apply_counter_updates(snapshot.counters, &counters)?.0)
        };
        command.encode()
    }

    /// Clock frame for `epoch` in local time; sent once, never confirmed
    pub fn compose_time_set(&self, device: &DeviceId, epoch: i64) -> Result<ComposedCommand> {
        self.compose_time_set_in(device, epoch, &Local)
    }

    /// Clock frame rendered in `tz`
    pub fn compose_time_set_in<Tz>(
        &self,
        device: &DeviceId,
        epoch: i64,
        tz: &Tz,
    ) -> Result<ComposedCommand>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        self.registry.register(device);
        let destination = self.resolve_destination(device)?;
        self.finish(device, destination, Command::time_set_in(epoch, tz), None, None)
    }

    fn finish(
        &self,
        device: &DeviceId,
        destination: String,
        command: Command,
        expectation: Option<(Field, FieldValue)>,
        change: Option<PendingChange>,
    ) -> Result<ComposedCommand> {
        let frame = command.encode()?;
        Ok(ComposedCommand {
            device: device.clone(),
            destination,
            command,
            frame,
            expectation,
            change,
        })
    }
}

/// Full counter block with `updates` applied over `cached`, plus the slot
/// finally written for each requested line
fn apply_counter_updates(
    cached: [CounterSlot; LINE_COUNT],
    updates: &[CounterUpdate],
) -> Result<([CounterSlot; LINE_COUNT], Vec<(LineIndex, CounterSlot)>)> {
    let mut slots = cached.map(CounterSlot::writable);
    let mut requested: Vec<(LineIndex, CounterSlot)> = Vec::with_capacity(updates.len());
    for update in updates {
        let slot = update.apply(slots[update.line.slot()])?;
        slots[update.line.slot()] = slot;
        requested.retain(|(line, _)| *line != update.line);
        requested.push((update.line, slot));
    }
    Ok((slots, requested))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FlagsBlock, LineConfig, StatusBits, SystemTelemetry};
    use chrono::Utc;

    fn dev() -> DeviceId {
        DeviceId::new("AA:BB:CC:DD:EE:FF")
    }

    fn line(n: u8) -> LineIndex {
        LineIndex::new(n).unwrap()
    }

    fn composer_with(valve: bool, dry: bool, close: bool, lines: u8) -> CommandComposer {
        let registry = DeviceRegistry::new();
        registry.apply_telemetry(
            &dev(),
            &SystemTelemetry {
                flags: Some(FlagsBlock {
                    valve_open: valve,
                    sensors_count: 0,
                    relay_count: 0,
                    dry_flag: dry,
                    close_on_offline: close,
                    line_config: LineConfig::new(lines),
                    status: StatusBits::new(0),
                    status_name: "normal".to_string(),
                }),
                counters: vec![
                    CounterSlot::new(100, 1),
                    CounterSlot::new(200, 1),
                    CounterSlot::new(300, 1),
                    CounterSlot::new(400, 1),
                ],
                ..Default::default()
            },
        );
        registry.learn_channel(&dev(), "cloud");
        CommandComposer::new(registry)
    }

    fn decoded_settings(cmd: &ComposedCommand) -> SettingsPayload {
        match Command::decode(&cmd.frame).unwrap() {
            Command::Settings(s) => s,
            other => panic!("expected settings, got {:?}", other),
        }
    }

    fn decoded_counters(cmd: &ComposedCommand) -> [CounterSlot; 4] {
        match Command::decode(&cmd.frame).unwrap() {
            Command::CounterWrite(slots) => slots,
            other => panic!("expected counters, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_update_isolation() {
        let composer = composer_with(true, false, false, 0b0101);
        let cmd = composer
            .compose_settings(&dev(), SettingsChange::DryFlag(true))
            .unwrap();

        let s = decoded_settings(&cmd);
        assert!(s.valve_open);
        assert!(s.dry_flag);
        assert!(!s.close_on_offline);
        assert_eq!(s.line_config.bits(), 0b0101);
        assert_eq!(
            cmd.expectation,
            Some((Field::DryFlag, FieldValue::Flag(true)))
        );
        assert_eq!(cmd.destination, "cloud");
    }

    #[test]
    fn test_back_to_back_requests_build_on_each_other() {
        let composer = composer_with(false, false, false, 0);
        let valve = composer
            .compose_settings(&dev(), SettingsChange::Valve(true))
            .unwrap();
        let dry = composer
            .compose_settings(&dev(), SettingsChange::DryFlag(true))
            .unwrap();

        let first = decoded_settings(&valve);
        assert!(first.valve_open);
        assert!(!first.dry_flag);

        let second = decoded_settings(&dry);
        assert!(second.valve_open);
        assert!(second.dry_flag);
        assert_eq!(composer.registry().get(&dev()).pending, 2);
    }

    #[test]
    fn test_rebuild_uses_current_snapshot() {
        let composer = composer_with(false, false, false, 0);
        let valve = composer
            .compose_settings(&dev(), SettingsChange::Valve(true))
            .unwrap();
        composer
            .compose_settings(&dev(), SettingsChange::DryFlag(true))
            .unwrap();

        let frame = composer.rebuild(&dev(), valve.change.as_ref()).unwrap();
        match Command::decode(&frame).unwrap() {
            Command::Settings(s) => {
                assert!(s.valve_open);
                assert!(s.dry_flag);
            }
            other => panic!("expected settings, got {:?}", other),
        }
    }

    #[test]
    fn test_rebuild_folds_changes_over_stale_telemetry() {
        let composer = composer_with(false, false, false, 0);
        let changes = [
            PendingChange::Settings(SettingsChange::Valve(true)),
            PendingChange::Settings(SettingsChange::line_type(2, LineKind::Counter).unwrap()),
        ];
        let frame = composer.rebuild(&dev(), &changes).unwrap();
        match Command::decode(&frame).unwrap() {
            Command::Settings(s) => {
                assert!(s.valve_open);
                assert_eq!(s.line_config.bits(), 0b0010);
            }
            other => panic!("expected settings, got {:?}", other),
        }
    }

    #[test]
    fn test_line_type_toggle() {
        let composer = composer_with(false, false, false, 0b0000);
        let cmd = composer
            .compose_settings(&dev(), SettingsChange::line_type(3, LineKind::Counter).unwrap())
            .unwrap();
        assert_eq!(decoded_settings(&cmd).line_config.bits(), 0b0100);
    }

    #[test]
    fn test_line_out_of_range() {
        assert!(matches!(
            SettingsChange::line_type(5, LineKind::Counter),
            Err(NeptunError::InvalidParameter(_))
        ));
        assert!(SettingsChange::line_type(0, LineKind::Sensor).is_err());
    }

    #[test]
    fn test_speculative_value_feeds_next_composition() {
        let composer = composer_with(false, false, false, 0);
        composer
            .registry()
            .apply_optimistic(&dev(), Field::Valve, &FieldValue::Flag(true));

        let cmd = composer
            .compose_settings(&dev(), SettingsChange::CloseOnOffline(true))
            .unwrap();
        let s = decoded_settings(&cmd);
        assert!(s.valve_open);
        assert!(s.close_on_offline);
    }

    #[test]
    fn test_counter_write_preserves_untouched_lines() {
        let composer = composer_with(false, false, false, 0);
        let cmd = composer
            .compose_counter_write(&dev(), &[CounterUpdate::value(line(2), 9999)])
            .unwrap();

        assert_eq!(
            decoded_counters(&cmd),
            [
                CounterSlot::new(100, 1),
                CounterSlot::new(9999, 1),
                CounterSlot::new(300, 1),
                CounterSlot::new(400, 1),
            ]
        );
        assert_eq!(
            cmd.expectation,
            Some((
                Field::Counters,
                FieldValue::Counters(vec![(line(2), CounterSlot::new(9999, 1))])
            ))
        );
    }

    #[test]
    fn test_second_counter_write_keeps_first_line() {
        let composer = composer_with(false, false, false, 0);
        composer
            .compose_counter_write(&dev(), &[CounterUpdate::value(line(1), 5000)])
            .unwrap();
        let second = composer
            .compose_counter_write(&dev(), &[CounterUpdate::value(line(2), 6000)])
            .unwrap();

        let slots = decoded_counters(&second);
        assert_eq!(slots[0], CounterSlot::new(5000, 1));
        assert_eq!(slots[1], CounterSlot::new(6000, 1));
        assert_eq!(
            second.change,
            Some(PendingChange::Counters(vec![CounterUpdate::value(line(2), 6000)]))
        );
    }

    #[test]
    fn test_counter_value_clamped() {
        let composer = composer_with(false, false, false, 0);
        let cmd = composer
            .compose_counter_write(
                &dev(),
                &[
                    CounterUpdate::value(line(1), -50),
                    CounterUpdate::value(line(4), i64::from(u32::MAX) + 10),
                ],
            )
            .unwrap();
        let slots = decoded_counters(&cmd);
        assert_eq!(slots[0].value, 0);
        assert_eq!(slots[3].value, u32::MAX);
    }

    #[test]
    fn test_counter_step_out_of_range() {
        let composer = composer_with(false, false, false, 0);
        for step in [0, 256, -1] {
            assert!(matches!(
                composer.compose_counter_write(&dev(), &[CounterUpdate::step(line(1), step)]),
                Err(NeptunError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_cached_zero_step_written_as_one() {
        let registry = DeviceRegistry::new();
        registry.learn_channel(&dev(), "cloud");
        let composer = CommandComposer::new(registry);

        let cmd = composer
            .compose_counter_write(&dev(), &[CounterUpdate::step(line(2), 10)])
            .unwrap();
        let slots = decoded_counters(&cmd);
        assert_eq!(slots[0], CounterSlot::new(0, 1));
        assert_eq!(slots[1], CounterSlot::new(0, 10));
    }

    #[test]
    fn test_destination_unknown() {
        let composer = CommandComposer::new(DeviceRegistry::new());
        assert!(matches!(
            composer.compose_settings(&dev(), SettingsChange::Valve(true)),
            Err(NeptunError::DestinationUnknown { .. })
        ));
        // The request still references the device
        assert_eq!(composer.registry().len(), 1);
    }

    #[test]
    fn test_destination_precedence() {
        let registry = DeviceRegistry::new();
        registry.learn_channel(&dev(), "learned");

        let composer = CommandComposer::new(registry.clone());
        assert_eq!(composer.resolve_destination(&dev()).unwrap(), "learned");

        let composer = composer.with_cloud_prefix("global");
        assert_eq!(composer.resolve_destination(&dev()).unwrap(), "global");

        let composer = composer.with_destination(dev(), "pinned");
        assert_eq!(composer.resolve_destination(&dev()).unwrap(), "pinned");
    }

    #[test]
    fn test_time_set_has_no_expectation() {
        let composer = composer_with(false, false, false, 0);
        let cmd = composer.compose_time_set_in(&dev(), 0, &Utc).unwrap();
        assert!(cmd.expectation.is_none());
        assert_eq!(
            Command::decode(&cmd.frame).unwrap(),
            Command::TimeSet("01/01/1970,00:00:00".to_string())
        );
    }
}
