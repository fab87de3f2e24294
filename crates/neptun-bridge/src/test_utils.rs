//! Test utilities: an in-memory bus and device frame fixtures
//!
//! [`MockBus`] is cheaply cloneable; a test keeps one clone to inject
//! messages and inspect what was published while the bridge owns the other.
//!
//! ```rust,ignore
//! use neptun_bridge::test_utils::{MockBus, SystemStateBuilder};
//!
//! let bus = MockBus::new();
//! let frame = SystemStateBuilder::new().flags(true, false, false, 0b0101).bytes()?;
//! bus.inject_frame("cloud", "AABBCCDDEEFF", &frame);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::tlv::put_record;
use crate::codec::{Frame, FrameType, SensorReport};
use crate::config::{NeptunConfig, NeptunConfigBuilder};
use crate::error::{NeptunError, Result};
use crate::interface::{topic_matches, BusInterface, BusMessage};

/// Source marker used on fixture frames coming from the cloud side
pub const CLOUD_SOURCE_MARKER: u8 = 0x41;

#[derive(Debug, Default)]
struct MockState {
    sender: Option<mpsc::UnboundedSender<BusMessage>>,
    published: Vec<BusMessage>,
    subscriptions: Vec<String>,
    connected: bool,
    connects: u32,
    fail_connect: bool,
    fail_publish: bool,
    fail_next_read: bool,
}

/// In-memory bus transport
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BusMessage>>>,
}

impl MockBus {
    /// Create a disconnected bus with an open inbound queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = MockState {
            sender: Some(tx),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            incoming: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Queue an inbound message
    pub fn inject(&self, message: BusMessage) {
        if let Some(tx) = &self.state.lock().sender {
            let _ = tx.send(message);
        }
    }

    /// Queue a device frame on `<channel>/<device>/from`
    pub fn inject_frame(&self, channel: &str, device: &str, frame: &[u8]) {
        self.inject(BusMessage::new(
            format!("{}/{}/from", channel, device),
            frame.to_vec(),
            false,
        ));
    }

    /// Queue a command request on `<prefix>/<device>/cmd/<name>`
    pub fn inject_command(&self, prefix: &str, device: &str, name: &str, payload: &str) {
        self.inject(BusMessage::new(
            format!("{}/{}/cmd/{}", prefix, device, name),
            payload.to_string(),
            false,
        ));
    }

    /// Close the inbound queue; the reader sees end of input once it is drained
    pub fn close_incoming(&self) {
        self.state.lock().sender = None;
    }

    /// Everything published so far
    pub fn published(&self) -> Vec<BusMessage> {
        self.state.lock().published.clone()
    }

    /// Messages published on exactly `topic`
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Messages published on topics matching a filter
    pub fn published_matching(&self, filter: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    /// Payload of the most recent message on `topic`
    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.state
            .lock()
            .published
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload_str())
    }

    /// Clear the published log
    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Filters passed to `subscribe`
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Make `connect` fail
    pub fn fail_connect(&self, enabled: bool) {
        self.state.lock().fail_connect = enabled;
    }

    /// Make `publish` fail
    pub fn fail_publish(&self, enabled: bool) {
        self.state.lock().fail_publish = enabled;
    }

    /// Make the next `read_message` fail once
    pub fn fail_next_read(&self) {
        self.state.lock().fail_next_read = true;
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusInterface for MockBus {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(NeptunError::ConnectionTimeout { duration_ms: 5000 });
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.state.lock().subscriptions.push(filter.to_string());
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<BusMessage>> {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(NeptunError::Disconnected);
            }
            if std::mem::take(&mut state.fail_next_read) {
                state.connected = false;
                return Err(NeptunError::ReadError("Simulated error".to_string()));
            }
        }

        let message = self.incoming.lock().await.recv().await;
        trace!(topic = ?message.as_ref().map(|m| &m.topic), "Mock bus read");
        Ok(message)
    }

    async fn publish(&mut self, message: &BusMessage) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NeptunError::Disconnected);
        }
        if state.fail_publish {
            return Err(NeptunError::WriteError("Simulated error".to_string()));
        }
        state.published.push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "MockBus"
    }
}

/// Builder for `system_state` (0x52) frames
#[derive(Debug, Clone, Default)]
pub struct SystemStateBuilder {
    records: Vec<(u8, Vec<u8>)>,
}

impl SystemStateBuilder {
    /// Start with an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    fn record(mut self, tag: u8, value: Vec<u8>) -> Self {
        self.records.push((tag, value));
        self
    }

    /// Device id string (0x49)
    pub fn device_id(self, id: &str) -> Self {
        self.record(0x49, id.as_bytes().to_vec())
    }

    /// MAC string (0x4D)
    pub fn mac(self, mac: &str) -> Self {
        self.record(0x4D, mac.as_bytes().to_vec())
    }

    /// Access flag (0x41)
    pub fn access(self, granted: bool) -> Self {
        self.record(0x41, vec![u8::from(granted)])
    }

    /// Flags block (0x53) with zero counts and status
    pub fn flags(self, valve: bool, dry: bool, close_on_offline: bool, lines: u8) -> Self {
        self.flags_with_status(valve, dry, close_on_offline, lines, 0)
    }

    /// Flags block (0x53) with a status byte
    pub fn flags_with_status(
        self,
        valve: bool,
        dry: bool,
        close_on_offline: bool,
        lines: u8,
        status: u8,
    ) -> Self {
        self.record(
            0x53,
            vec![
                u8::from(valve),
                0,
                0,
                u8::from(dry),
                u8::from(close_on_offline),
                lines,
                status,
            ],
        )
    }

    /// Wireless sensors (0x73)
    pub fn sensors(self, sensors: &[SensorReport]) -> Self {
        self.record(0x73, sensor_groups(sensors))
    }

    /// Wired lines (0x4C), one byte per line
    pub fn wired(self, states: [bool; 4]) -> Self {
        self.record(0x4C, states.iter().map(|&s| u8::from(s)).collect())
    }

    /// Wired lines (0x4C), single bitmask byte
    pub fn wired_bitmask(self, mask: u8) -> Self {
        self.record(0x4C, vec![mask])
    }

    /// Counters (0x43) as (value, step) per line
    pub fn counters(self, slots: &[(u32, u8)]) -> Self {
        let mut value = Vec::with_capacity(slots.len() * 5);
        for (v, step) in slots {
            value.extend_from_slice(&v.to_be_bytes());
            value.push(*step);
        }
        self.record(0x43, value)
    }

    /// Module signal level (0x57)
    pub fn signal(self, level: u8) -> Self {
        self.record(0x57, vec![level])
    }

    /// TLV payload
    pub fn payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (tag, value) in &self.records {
            put_record(&mut out, *tag, value)?;
        }
        Ok(out)
    }

    /// Complete frame
    pub fn frame(&self) -> Result<Frame> {
        Frame::build(CLOUD_SOURCE_MARKER, FrameType::SystemState, &self.payload()?)
    }

    /// Complete frame as raw bytes
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.frame()?.as_bytes().to_vec())
    }
}

fn sensor_groups(sensors: &[SensorReport]) -> Vec<u8> {
    sensors
        .iter()
        .flat_map(|s| [s.signal_level, s.sensor_id, s.battery_percent, s.leak_state])
        .collect()
}

/// A `sensor_state` (0x53) frame
pub fn sensor_state_frame(sensors: &[SensorReport]) -> Result<Frame> {
    let mut payload = vec![0x00, 0x00];
    payload.extend(sensor_groups(sensors));
    Frame::build(CLOUD_SOURCE_MARKER, FrameType::SensorState, &payload)
}

/// A wireless sensor report
pub fn sensor(id: u8, battery: u8, signal: u8, leak: bool) -> SensorReport {
    SensorReport {
        sensor_id: id,
        signal_level: signal,
        battery_percent: battery,
        leak_state: u8::from(leak),
    }
}

/// Copy of `frame` with the declared length bumped by one
pub fn with_bad_length(frame: &[u8]) -> Vec<u8> {
    let mut bytes = frame.to_vec();
    if bytes.len() > 5 {
        let len = u16::from_be_bytes([bytes[4], bytes[5]]).wrapping_add(1);
        bytes[4..6].copy_from_slice(&len.to_be_bytes());
    }
    bytes
}

/// Copy of `frame` with the last CRC byte flipped
pub fn with_bad_crc(frame: &[u8]) -> Vec<u8> {
    let mut bytes = frame.to_vec();
    if let Some(last) = bytes.last_mut() {
        *last ^= 0xFF;
    }
    bytes
}

/// Bus plus configuration for a test scenario
pub struct TestFixture {
    /// Mock bus
    pub bus: MockBus,
    /// Test configuration
    pub config: NeptunConfig,
}

impl TestFixture {
    /// Default configuration, learned destinations
    pub fn new() -> Self {
        Self {
            bus: MockBus::new(),
            config: NeptunConfigBuilder::new().build(),
        }
    }

    /// All traffic pinned to one cloud prefix
    pub fn with_cloud_prefix(prefix: &str) -> Self {
        Self {
            bus: MockBus::new(),
            config: NeptunConfigBuilder::new().cloud_prefix(prefix).build(),
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
