//! Device registry: per-device settings snapshots
//!
//! Every device the bridge has heard about, by telemetry, by a command
//! request or through configuration, has one entry here for the lifetime of
//! the process. Entries are never removed.
//!
//! # Two-phase fields
//!
//! Each settings field and each counter line keeps two values:
//!
//! - a *confirmed* value, written only by telemetry
//! - an optional *speculative* value, written when a command is issued
//!
//! Command composition reads the effective value (speculative if present,
//! otherwise confirmed). Convergence checks read the confirmed value only.
//! Applying telemetry overwrites the confirmed value and drops the
//! speculative one.
//!
//! # Locking
//!
//! The map lock only guards entry creation. Each entry has its own mutex,
//! so telemetry for one device never waits on a command for another.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::{
    CounterSlot, LineConfig, LineIndex, LineKind, SettingsPayload, SystemTelemetry, LINE_COUNT,
};
use crate::config::NeptunConfig;
use crate::error::Result;

/// Smallest accepted per-device lost timeout
pub const MIN_LOST_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted per-device lost timeout
pub const MAX_LOST_TIMEOUT: Duration = Duration::from_secs(3600);

/// Lost timeout used when none is configured
pub const DEFAULT_LOST_TIMEOUT: Duration = Duration::from_secs(300);

/// Device identifier: the MAC as it appears in the bus topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a topic segment
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A field a command can drive to a desired value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Main valve
    Valve,
    /// Dry mode
    DryFlag,
    /// Close on sensor loss
    CloseOnOffline,
    /// Input type of one wired line
    LineType(LineIndex),
    /// Counter block (always written as a whole)
    Counters,
}

impl Field {
    /// Name used in command and result topics
    pub fn topic_name(&self) -> String {
        match self {
            Field::Valve => "valve".to_string(),
            Field::DryFlag => "dry_flag".to_string(),
            Field::CloseOnOffline => "close_on_offline".to_string(),
            Field::LineType(line) => format!("line_{}_type", line.number()),
            Field::Counters => "counters".to_string(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic_name())
    }
}

/// Value of a [`Field`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean setting
    Flag(bool),
    /// Line input type
    Line(LineKind),
    /// Requested counter lines and the slots written for them
    Counters(Vec<(LineIndex, CounterSlot)>),
}

/// A value with a telemetry-confirmed and a command-speculative phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tracked<T> {
    confirmed: Option<T>,
    speculative: Option<T>,
}

impl<T: Copy + Default> Tracked<T> {
    /// Value reported by the device, if it ever reported one
    pub fn confirmed(&self) -> Option<T> {
        self.confirmed
    }

    /// Value set by a command and not yet overwritten by telemetry
    pub fn speculative(&self) -> Option<T> {
        self.speculative
    }

    /// Value used for composition
    pub fn effective(&self) -> T {
        self.speculative.or(self.confirmed).unwrap_or_default()
    }

    fn confirm(&mut self, value: T) {
        self.confirmed = Some(value);
        self.speculative = None;
    }

    fn speculate(&mut self, value: T) {
        self.speculative = Some(value);
    }
}

/// Mutable state of one device
#[derive(Debug)]
pub struct DeviceEntry {
    valve_open: Tracked<bool>,
    dry_flag: Tracked<bool>,
    close_on_offline: Tracked<bool>,
    line_config: Tracked<LineConfig>,
    counters: [Tracked<CounterSlot>; LINE_COUNT],
    last_seen: Option<Instant>,
    lost_timeout: Duration,
    channel: Option<String>,
    last_lost: Option<bool>,
}

impl DeviceEntry {
    fn new(lost_timeout: Duration) -> Self {
        Self {
            valve_open: Tracked::default(),
            dry_flag: Tracked::default(),
            close_on_offline: Tracked::default(),
            line_config: Tracked::default(),
            counters: [Tracked::default(); LINE_COUNT],
            last_seen: None,
            lost_timeout,
            channel: None,
            last_lost: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = Some(match self.last_seen {
            Some(prev) => prev.max(now),
            None => now,
        });
    }

    fn apply_telemetry(&mut self, telemetry: &SystemTelemetry) {
        if let Some(flags) = &telemetry.flags {
            self.valve_open.confirm(flags.valve_open);
            self.dry_flag.confirm(flags.dry_flag);
            self.close_on_offline.confirm(flags.close_on_offline);
            self.line_config.confirm(flags.line_config);
        }
        for (tracked, slot) in self.counters.iter_mut().zip(&telemetry.counters) {
            tracked.confirm(*slot);
        }
    }

    fn apply_optimistic(&mut self, field: Field, value: &FieldValue) -> bool {
        match (field, value) {
            (Field::Valve, FieldValue::Flag(v)) => self.valve_open.speculate(*v),
            (Field::DryFlag, FieldValue::Flag(v)) => self.dry_flag.speculate(*v),
            (Field::CloseOnOffline, FieldValue::Flag(v)) => self.close_on_offline.speculate(*v),
            (Field::LineType(line), FieldValue::Line(kind)) => {
                let mask = self.line_config.effective().with(line, *kind);
                self.line_config.speculate(mask);
            }
            (Field::Counters, FieldValue::Counters(lines)) => {
                for (line, slot) in lines {
                    self.counters[line.slot()].speculate(*slot);
                }
            }
            _ => return false,
        }
        true
    }

    fn is_converged(&self, field: Field, desired: &FieldValue) -> bool {
        match (field, desired) {
            (Field::Valve, FieldValue::Flag(v)) => self.valve_open.confirmed() == Some(*v),
            (Field::DryFlag, FieldValue::Flag(v)) => self.dry_flag.confirmed() == Some(*v),
            (Field::CloseOnOffline, FieldValue::Flag(v)) => {
                self.close_on_offline.confirmed() == Some(*v)
            }
            (Field::LineType(line), FieldValue::Line(kind)) => {
                self.line_config.confirmed().map(|c| c.kind(line)) == Some(*kind)
            }
            (Field::Counters, FieldValue::Counters(lines)) => lines
                .iter()
                .all(|(line, slot)| self.counters[line.slot()].confirmed() == Some(*slot)),
            _ => false,
        }
    }

    /// Lost when never seen, or silent for longer than the timeout
    pub fn is_lost_at(&self, now: Instant) -> bool {
        match self.last_seen {
            None => true,
            Some(seen) => now.saturating_duration_since(seen) > self.lost_timeout,
        }
    }

    /// Record a liveness evaluation; returns whether it differs from the previous one
    pub fn record_liveness(&mut self, lost: bool) -> bool {
        let changed = self.last_lost != Some(lost);
        self.last_lost = Some(lost);
        changed
    }

    fn snapshot(&self, device: &DeviceId) -> DeviceSnapshot {
        DeviceSnapshot {
            device: device.clone(),
            valve_open: self.valve_open.effective(),
            dry_flag: self.dry_flag.effective(),
            close_on_offline: self.close_on_offline.effective(),
            line_config: self.line_config.effective(),
            counters: self.counters.map(|c| c.effective()),
            confirmed: self.valve_open.confirmed().is_some()
                || self.counters.iter().any(|c| c.confirmed().is_some()),
            pending: self.pending_count(),
            last_seen: self.last_seen,
            lost_timeout: self.lost_timeout,
            channel: self.channel.clone(),
        }
    }

    fn pending_count(&self) -> usize {
        [
            self.valve_open.speculative().is_some(),
            self.dry_flag.speculative().is_some(),
            self.close_on_offline.speculative().is_some(),
            self.line_config.speculative().is_some(),
        ]
        .into_iter()
        .chain(self.counters.iter().map(|c| c.speculative().is_some()))
        .filter(|&pending| pending)
        .count()
    }
}

/// Point-in-time copy of a device's effective state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Device identifier
    pub device: DeviceId,
    /// Valve open
    pub valve_open: bool,
    /// Dry mode
    pub dry_flag: bool,
    /// Close valve on sensor loss
    pub close_on_offline: bool,
    /// Line input types
    pub line_config: LineConfig,
    /// Last raw counter readings (or pending writes), index 0 is line 1
    pub counters: [CounterSlot; LINE_COUNT],
    /// True once any telemetry has been applied
    pub confirmed: bool,
    /// Number of fields holding a speculative value
    pub pending: usize,
    /// Last valid frame from the device
    pub last_seen: Option<Instant>,
    /// Silence allowed before the device counts as lost
    pub lost_timeout: Duration,
    /// Channel learned from the most recent inbound frame
    pub channel: Option<String>,
}

impl DeviceSnapshot {
    /// Settings block as it would be written right now
    pub fn settings(&self) -> SettingsPayload {
        SettingsPayload {
            valve_open: self.valve_open,
            dry_flag: self.dry_flag,
            close_on_offline: self.close_on_offline,
            line_config: self.line_config,
        }
    }
}

/// Registry counters for monitoring
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Telemetry records applied
    pub telemetry_updates: u64,
    /// Speculative values written by commands
    pub optimistic_updates: u64,
    /// Channels learned or changed
    pub channel_changes: u64,
}

/// Clamp a lost timeout into the accepted range
pub fn clamp_lost_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_LOST_TIMEOUT, MAX_LOST_TIMEOUT)
}

/// Shared registry of device entries; clones share the same data
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, Arc<Mutex<DeviceEntry>>>>>,
    default_lost_timeout: Duration,
    stats: Arc<Mutex<RegistryStats>>,
}

impl DeviceRegistry {
    /// Create an empty registry with the default lost timeout
    pub fn new() -> Self {
        Self::with_lost_timeout(DEFAULT_LOST_TIMEOUT)
    }

    /// Create with a custom default lost timeout (clamped)
    pub fn with_lost_timeout(timeout: Duration) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            default_lost_timeout: clamp_lost_timeout(timeout),
            stats: Arc::new(Mutex::new(RegistryStats::default())),
        }
    }

    /// Create from configuration: devices with a static destination or a
    /// per-device lost timeout are registered up front
    pub fn from_config(config: &NeptunConfig) -> Self {
        let registry = Self::with_lost_timeout(config.liveness.default_lost_timeout);
        for device in config.destinations.keys() {
            registry.register(&DeviceId::new(device.as_str()));
        }
        for (device, timeout) in &config.liveness.device_timeouts {
            registry.set_lost_timeout(&DeviceId::new(device.as_str()), *timeout);
        }
        registry
    }

    /// Entry for a device, created on first reference
    pub fn entry(&self, device: &DeviceId) -> Arc<Mutex<DeviceEntry>> {
        if let Some(entry) = self.devices.read().get(device) {
            return Arc::clone(entry);
        }

        let mut devices = self.devices.write();
        Arc::clone(devices.entry(device.clone()).or_insert_with(|| {
            debug!(device = %device, "Registering device");
            Arc::new(Mutex::new(DeviceEntry::new(self.default_lost_timeout)))
        }))
    }

    /// Current snapshot, creating a zero-value entry if needed
    pub fn get(&self, device: &DeviceId) -> DeviceSnapshot {
        self.entry(device).lock().snapshot(device)
    }

    /// Reference a device without telemetry
    pub fn register(&self, device: &DeviceId) {
        self.entry(device);
    }

    /// Apply a decoded `system_state` record
    pub fn apply_telemetry(&self, device: &DeviceId, telemetry: &SystemTelemetry) {
        self.apply_telemetry_at(device, telemetry, Instant::now());
    }

    /// Apply telemetry as if received at `now`
    pub fn apply_telemetry_at(&self, device: &DeviceId, telemetry: &SystemTelemetry, now: Instant) {
        let entry = self.entry(device);
        {
            let mut entry = entry.lock();
            entry.apply_telemetry(telemetry);
            entry.touch(now);
        }
        self.stats.lock().telemetry_updates += 1;
        trace!(device = %device, "Applied telemetry");
    }

    /// Mark the device as heard from without changing settings
    pub fn touch(&self, device: &DeviceId) {
        self.touch_at(device, Instant::now());
    }

    /// Mark the device as heard from at `now`
    pub fn touch_at(&self, device: &DeviceId, now: Instant) {
        self.entry(device).lock().touch(now);
    }

    /// Write one field speculatively. Returns false when field and value kinds disagree.
    pub fn apply_optimistic(&self, device: &DeviceId, field: Field, value: &FieldValue) -> bool {
        let applied = self.entry(device).lock().apply_optimistic(field, value);
        if applied {
            self.stats.lock().optimistic_updates += 1;
        }
        applied
    }

    /// Compose against the effective snapshot and write the returned
    /// expectation speculatively, both under the device's entry lock
    ///
    /// A second composition for the same device always sees the first
    /// one's speculative value, whatever order the retry task runs in.
    pub fn compose_speculative<R>(
        &self,
        device: &DeviceId,
        compose: impl FnOnce(&DeviceSnapshot) -> Result<(R, Option<(Field, FieldValue)>)>,
    ) -> Result<R> {
        let entry = self.entry(device);
        let mut entry = entry.lock();
        let (composed, expectation) = compose(&entry.snapshot(device))?;
        if let Some((field, value)) = expectation {
            if entry.apply_optimistic(field, &value) {
                self.stats.lock().optimistic_updates += 1;
            }
        }
        Ok(composed)
    }

    /// True when the confirmed value of `field` equals `desired`
    pub fn is_converged(&self, device: &DeviceId, field: Field, desired: &FieldValue) -> bool {
        self.entry(device).lock().is_converged(field, desired)
    }

    /// Remember the channel of the most recent inbound frame
    pub fn learn_channel(&self, device: &DeviceId, channel: &str) {
        let entry = self.entry(device);
        let mut entry = entry.lock();
        if entry.channel.as_deref() != Some(channel) {
            debug!(device = %device, channel, "Learned device channel");
            entry.channel = Some(channel.to_string());
            self.stats.lock().channel_changes += 1;
        }
    }

    /// Forget the learned channel
    pub fn forget_channel(&self, device: &DeviceId) {
        self.entry(device).lock().channel = None;
    }

    /// Learned channel, if any
    pub fn channel(&self, device: &DeviceId) -> Option<String> {
        self.entry(device).lock().channel.clone()
    }

    /// Set the lost timeout of one device, clamped to 10 s..=3600 s
    pub fn set_lost_timeout(&self, device: &DeviceId, timeout: Duration) {
        self.entry(device).lock().lost_timeout = clamp_lost_timeout(timeout);
    }

    /// Every device ever referenced, sorted
    pub fn known_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.devices.read().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Entries paired with their ids, without holding the map lock afterwards
    pub fn entries(&self) -> Vec<(DeviceId, Arc<Mutex<DeviceEntry>>)> {
        let mut entries: Vec<_> = self
            .devices
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if no device is known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default lost timeout for new entries
    pub fn default_lost_timeout(&self) -> Duration {
        self.default_lost_timeout
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        self.stats.lock().clone()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FlagsBlock, StatusBits};

    fn dev() -> DeviceId {
        DeviceId::new("AA:BB:CC:DD:EE:FF")
    }

    fn flags(valve: bool, dry: bool, close: bool, lines: u8) -> FlagsBlock {
        FlagsBlock {
            valve_open: valve,
            sensors_count: 0,
            relay_count: 0,
            dry_flag: dry,
            close_on_offline: close,
            line_config: LineConfig::new(lines),
            status: StatusBits::new(0),
            status_name: "normal".to_string(),
        }
    }

    fn telemetry(valve: bool, dry: bool, close: bool, lines: u8) -> SystemTelemetry {
        SystemTelemetry {
            flags: Some(flags(valve, dry, close, lines)),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_creates_zero_snapshot() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());

        let snap = registry.get(&dev());
        assert!(!snap.valve_open);
        assert_eq!(snap.line_config.bits(), 0);
        assert_eq!(snap.counters, [CounterSlot::default(); LINE_COUNT]);
        assert!(!snap.confirmed);
        assert_eq!(snap.last_seen, None);
        assert_eq!(snap.lost_timeout, DEFAULT_LOST_TIMEOUT);
        assert_eq!(registry.known_devices(), vec![dev()]);
    }

    #[test]
    fn test_telemetry_overwrites_and_clears_speculative() {
        let registry = DeviceRegistry::new();
        registry.apply_telemetry(&dev(), &telemetry(true, false, false, 0b0101));
        assert!(registry.apply_optimistic(&dev(), Field::DryFlag, &FieldValue::Flag(true)));

        let snap = registry.get(&dev());
        assert!(snap.dry_flag);
        assert_eq!(snap.pending, 1);
        assert!(!registry.is_converged(&dev(), Field::DryFlag, &FieldValue::Flag(true)));

        // Device still reports dry=false: telemetry wins
        registry.apply_telemetry(&dev(), &telemetry(true, false, false, 0b0101));
        let snap = registry.get(&dev());
        assert!(!snap.dry_flag);
        assert_eq!(snap.pending, 0);
    }

    #[test]
    fn test_convergence_reads_confirmed_only() {
        let registry = DeviceRegistry::new();
        registry.apply_optimistic(&dev(), Field::Valve, &FieldValue::Flag(true));
        assert!(!registry.is_converged(&dev(), Field::Valve, &FieldValue::Flag(true)));

        registry.apply_telemetry(&dev(), &telemetry(true, false, false, 0));
        assert!(registry.is_converged(&dev(), Field::Valve, &FieldValue::Flag(true)));
    }

    #[test]
    fn test_never_reported_is_not_converged() {
        let registry = DeviceRegistry::new();
        assert!(!registry.is_converged(&dev(), Field::Valve, &FieldValue::Flag(false)));
    }

    #[test]
    fn test_line_type_speculation_touches_one_bit() {
        let registry = DeviceRegistry::new();
        registry.apply_telemetry(&dev(), &telemetry(false, false, false, 0b1001));

        let line2 = LineIndex::new(2).unwrap();
        registry.apply_optimistic(&dev(), Field::LineType(line2), &FieldValue::Line(LineKind::Counter));
        assert_eq!(registry.get(&dev()).line_config.bits(), 0b1011);

        let line1 = LineIndex::new(1).unwrap();
        registry.apply_optimistic(&dev(), Field::LineType(line1), &FieldValue::Line(LineKind::Sensor));
        assert_eq!(registry.get(&dev()).line_config.bits(), 0b1010);

        // Line 4 is confirmed as counter already
        let line4 = LineIndex::new(4).unwrap();
        assert!(registry.is_converged(
            &dev(),
            Field::LineType(line4),
            &FieldValue::Line(LineKind::Counter)
        ));
    }

    #[test]
    fn test_counter_slots_stored_per_line() {
        let registry = DeviceRegistry::new();
        let t = SystemTelemetry {
            counters: vec![CounterSlot::new(100, 1), CounterSlot::new(200, 10)],
            ..Default::default()
        };
        registry.apply_telemetry(&dev(), &t);

        let snap = registry.get(&dev());
        assert_eq!(snap.counters[1], CounterSlot::new(200, 10));
        assert_eq!(snap.counters[2], CounterSlot::default());

        let line2 = LineIndex::new(2).unwrap();
        let desired = FieldValue::Counters(vec![(line2, CounterSlot::new(200, 10))]);
        assert!(registry.is_converged(&dev(), Field::Counters, &desired));
    }

    #[test]
    fn test_mismatched_field_value_rejected() {
        let registry = DeviceRegistry::new();
        assert!(!registry.apply_optimistic(&dev(), Field::Valve, &FieldValue::Line(LineKind::Counter)));
        assert_eq!(registry.stats().optimistic_updates, 0);
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let registry = DeviceRegistry::new();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(60);

        registry.touch_at(&dev(), later);
        registry.touch_at(&dev(), t0);
        assert_eq!(registry.get(&dev()).last_seen, Some(later));
    }

    #[test]
    fn test_lost_timeout_clamped() {
        let registry = DeviceRegistry::new();
        registry.set_lost_timeout(&dev(), Duration::from_secs(1));
        assert_eq!(registry.get(&dev()).lost_timeout, MIN_LOST_TIMEOUT);

        registry.set_lost_timeout(&dev(), Duration::from_secs(86_400));
        assert_eq!(registry.get(&dev()).lost_timeout, MAX_LOST_TIMEOUT);

        registry.set_lost_timeout(&dev(), Duration::from_secs(60));
        assert_eq!(registry.get(&dev()).lost_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_learn_channel() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.channel(&dev()), None);

        registry.learn_channel(&dev(), "cloud-a");
        registry.learn_channel(&dev(), "cloud-a");
        registry.learn_channel(&dev(), "cloud-b");
        assert_eq!(registry.channel(&dev()).as_deref(), Some("cloud-b"));
        assert_eq!(registry.stats().channel_changes, 2);

        registry.forget_channel(&dev());
        assert_eq!(registry.channel(&dev()), None);
    }

    #[test]
    fn test_lost_evaluation() {
        let registry = DeviceRegistry::new();
        let t = Instant::now();
        let entry = registry.entry(&dev());

        assert!(entry.lock().is_lost_at(t));
        registry.touch_at(&dev(), t);
        assert!(!entry.lock().is_lost_at(t + Duration::from_secs(299)));
        assert!(!entry.lock().is_lost_at(t + Duration::from_secs(300)));
        assert!(entry.lock().is_lost_at(t + Duration::from_secs(301)));
    }

    #[test]
    fn test_record_liveness_changes() {
        let registry = DeviceRegistry::new();
        let entry = registry.entry(&dev());
        let mut entry = entry.lock();
        assert!(entry.record_liveness(true));
        assert!(!entry.record_liveness(true));
        assert!(entry.record_liveness(false));
    }

    #[test]
    fn test_clone_shares_entries() {
        let registry = DeviceRegistry::new();
        let other = registry.clone();
        other.register(&dev());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_from_config_registers_static_destinations() {
        let config = crate::config::NeptunConfigBuilder::new()
            .destination("AA:BB", "vendor")
            .device_lost_timeout("CC:DD", Duration::from_secs(60))
            .build();
        let registry = DeviceRegistry::from_config(&config);

        assert_eq!(
            registry.known_devices(),
            vec![DeviceId::new("AA:BB"), DeviceId::new("CC:DD")]
        );
        let entry = registry.entry(&DeviceId::new("AA:BB"));
        assert!(entry.lock().is_lost_at(Instant::now()));
    }

    #[test]
    fn test_compose_speculative_records_expectation() {
        let registry = DeviceRegistry::new();
        registry.apply_telemetry(&dev(), &telemetry(false, false, false, 0));

        let seen = registry
            .compose_speculative(&dev(), |snap| {
                Ok((snap.valve_open, Some((Field::Valve, FieldValue::Flag(true)))))
            })
            .unwrap();
        assert!(!seen);

        // The next composition reads the first one's value
        let seen = registry
            .compose_speculative(&dev(), |snap| {
                Ok((snap.valve_open, Some((Field::DryFlag, FieldValue::Flag(true)))))
            })
            .unwrap();
        assert!(seen);
        assert_eq!(registry.get(&dev()).pending, 2);
        assert_eq!(registry.stats().optimistic_updates, 2);
    }

    #[test]
    fn test_compose_speculative_error_leaves_state() {
        let registry = DeviceRegistry::new();
        let result: Result<()> = registry.compose_speculative(&dev(), |_| {
            Err(crate::error::NeptunError::InvalidParameter("bad".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(registry.get(&dev()).pending, 0);
    }

    #[test]
    fn test_field_topic_names() {
        assert_eq!(Field::Valve.topic_name(), "valve");
        assert_eq!(
            Field::LineType(LineIndex::new(3).unwrap()).to_string(),
            "line_3_type"
        );
    }
}
