//! NeptunBridge - event loop between device frames and the local bus
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          NeptunBridge                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  <cloud>/<mac>/from ──► validate ──► decode ──► DeviceRegistry   │
//! │                                          │                       │
//! │                                          └──► <prefix>/<mac>/... │
//! │                                                                  │
//! │  <prefix>/<mac>/cmd/* ──► parse ──► CommandComposer              │
//! │                                          │                       │
//! │                                          ▼                       │
//! │                                   RetrySupervisor ──► <dst>/to   │
//! │                                          │                       │
//! │                                          └──► cmd/<field>/result │
//! │                                                                  │
//! │  LivenessWatchdog (period) ──► <prefix>/<mac>/state/lost         │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The bridge owns the bus transport. The retry supervisor and the watchdog
//! run as their own tasks and hand messages back through a bounded queue,
//! so only the event loop ever writes to the bus.
//!
//! # Example
//!
//! ```rust,ignore
//! use neptun_bridge::{NeptunBridge, NeptunConfig, StdioInterface};
//!
//! let config = NeptunConfig::default();
//! let (bridge, handle) = NeptunBridge::new(StdioInterface::stdio(), &config)?;
//! bridge.run().await?;
//! ```

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{decode_sensor_telemetry, decode_system_telemetry, Frame, FrameType};
use crate::composer::CommandComposer;
use crate::config::{NeptunConfig, ReconnectConfig};
use crate::error::{NeptunError, Result};
use crate::interface::{BusInterface, BusMessage};
use crate::registry::{DeviceId, DeviceRegistry, DeviceSnapshot};
use crate::retry::{RetryHandle, RetryReport, RetryStats, RetrySupervisor, SendCallback};
use crate::topics::{parse_command, CommandRequest, InboundTopic, TopicLayout};
use crate::watchdog::{LivenessCallback, LivenessWatchdog};

const BRIDGE_COMMAND_QUEUE: usize = 256;

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Process a message as if it had arrived on the bus
    Deliver(BusMessage),
    /// Execute a command request and report whether it was accepted
    Request {
        /// Target device
        device: DeviceId,
        /// Parsed request
        request: CommandRequest,
        /// Acceptance result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Messages read from the bus
    pub messages_received: u64,
    /// Device frames that passed validation
    pub frames_accepted: u64,
    /// Device frames rejected by validation
    pub frames_rejected: u64,
    /// `system_state` frames applied only partially
    pub frames_truncated: u64,
    /// Commands handed to the retry supervisor
    pub commands_issued: u64,
    /// Command requests refused
    pub commands_rejected: u64,
    /// Messages published
    pub messages_published: u64,
    /// Publishes the transport refused
    pub publish_errors: u64,
    /// Read errors from the transport
    pub interface_errors: u64,
    /// Successful reconnects
    pub reconnects: u64,
    /// Retry outcomes published
    pub outcomes_published: u64,
}

/// Handle for controlling the NeptunBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    retry: RetryHandle,
    registry: DeviceRegistry,
}

impl BridgeHandle {
    /// Process a message as if it had arrived on the bus
    pub async fn deliver(&self, message: BusMessage) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Deliver(message))
            .await
            .map_err(|_| NeptunError::ChannelClosed)
    }

    /// Execute a command request
    ///
    /// Fails synchronously when the request cannot be composed, e.g. no
    /// destination is known for the device yet.
    pub async fn request(&self, device: DeviceId, request: CommandRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Request {
                device,
                request,
                reply,
            })
            .await
            .map_err(|_| NeptunError::ChannelClosed)?;
        rx.await.map_err(|_| NeptunError::ChannelClosed)?
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| NeptunError::ChannelClosed)?;
        rx.await.map_err(|_| NeptunError::ChannelClosed)
    }

    /// Get retry supervisor statistics
    pub async fn retry_stats(&self) -> Result<RetryStats> {
        self.retry.stats().await
    }

    /// Receive every retry outcome from now on
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<RetryReport> {
        self.retry.subscribe()
    }

    /// Shared device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current state of one device
    pub fn snapshot(&self, device: &DeviceId) -> DeviceSnapshot {
        self.registry.get(device)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| NeptunError::ChannelClosed)
    }
}

/// Main bridge service between Neptun devices and the local bus
pub struct NeptunBridge<I: BusInterface> {
    /// Bus transport
    interface: I,
    /// Topic naming and rendering
    layout: TopicLayout,
    /// Device state
    registry: DeviceRegistry,
    /// Command frame builder
    composer: CommandComposer,
    /// Retry supervisor, moved into its task by `run`
    supervisor: Option<RetrySupervisor>,
    /// Retry supervisor handle
    retry: RetryHandle,
    /// Liveness watchdog, moved into its task by `run`
    watchdog: Option<LivenessWatchdog>,
    /// Producer side of the outgoing queue, for the task callbacks
    outgoing_tx: mpsc::Sender<BusMessage>,
    /// Messages produced outside the event loop
    outgoing_rx: mpsc::Receiver<BusMessage>,
    /// Retry outcomes
    outcome_rx: broadcast::Receiver<RetryReport>,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Reconnection policy
    reconnect: ReconnectConfig,
    /// Bridge statistics
    stats: BridgeStats,
}

impl<I: BusInterface + Send + 'static> NeptunBridge<I> {
    /// Create a bridge over `interface`
    pub fn new(interface: I, config: &NeptunConfig) -> Result<(Self, BridgeHandle)> {
        config.validate()?;

        let registry = DeviceRegistry::from_config(config);
        let composer = CommandComposer::from_config(registry.clone(), config);
        let layout = TopicLayout::from_config(config);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.bridge.outgoing_queue_size.max(1));

        let send_layout = layout.clone();
        let send_tx = outgoing_tx.clone();
        let send: SendCallback = Arc::new(move |outbound| {
            send_tx
                .try_send(send_layout.outbound_message(&outbound))
                .map_err(|e| e.to_string())
        });

        let (supervisor, retry) = RetrySupervisor::new(composer.clone(), &config.retry, send);
        let outcome_rx = retry.subscribe();
        let watchdog = LivenessWatchdog::from_config(registry.clone(), config);

        let (command_tx, command_rx) = mpsc::channel(BRIDGE_COMMAND_QUEUE);
        let handle = BridgeHandle {
            command_tx,
            retry: retry.clone(),
            registry: registry.clone(),
        };

        let bridge = Self {
            interface,
            layout,
            registry,
            composer,
            supervisor: Some(supervisor),
            retry,
            watchdog: Some(watchdog),
            outgoing_tx,
            outgoing_rx,
            outcome_rx,
            command_rx,
            reconnect: config.reconnect.clone(),
            stats: BridgeStats::default(),
        };

        Ok((bridge, handle))
    }

    /// Run the bridge service
    ///
    /// Returns when the bus closes, on shutdown, or when reconnection gives up.
    pub async fn run(mut self) -> Result<()> {
        info!(interface = %self.interface.name(), "Starting Neptun bridge");

        self.interface.connect().await?;
        self.subscribe_all().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor_task = self.supervisor.take().map(|s| tokio::spawn(s.run()));
        let watchdog_task = self
            .watchdog
            .take()
            .map(|w| w.spawn(self.liveness_callback(), shutdown_rx));

        let mut exit = Ok(());
        loop {
            tokio::select! {
                read = self.interface.read_message() => {
                    match read {
                        Ok(Some(message)) => self.handle_message(message).await,
                        Ok(None) => {
                            info!("Bus closed");
                            break;
                        }
                        Err(e) => {
                            warn!("Error reading from bus: {}", e);
                            self.stats.interface_errors += 1;
                            if let Err(reconnect_err) = self.try_reconnect().await {
                                error!("Failed to reconnect: {}", reconnect_err);
                                exit = Err(reconnect_err);
                                break;
                            }
                        }
                    }
                }

                Some(message) = self.outgoing_rx.recv() => {
                    self.publish(&message).await;
                }

                outcome = self.outcome_rx.recv() => {
                    match outcome {
                        Ok(report) => {
                            let message = self.layout.render_outcome(&report);
                            self.publish(&message).await;
                            self.stats.outcomes_published += 1;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Dropped {} retry outcomes", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BridgeCommand::Deliver(message) => self.handle_message(message).await,
                        BridgeCommand::Request { device, request, reply } => {
                            let result = self.execute(&device, request).await;
                            if let Err(e) = &result {
                                debug!(device = %device, "Request refused: {}", e);
                                self.stats.commands_rejected += 1;
                            }
                            let _ = reply.send(result);
                        }
                        BridgeCommand::GetStats(tx) => {
                            let _ = tx.send(self.stats.clone());
                        }
                        BridgeCommand::Shutdown => {
                            info!("Bridge shutdown requested");
                            break;
                        }
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        let _ = self.retry.shutdown().await;
        if let Some(task) = watchdog_task {
            let _ = task.await;
        }
        if let Some(task) = supervisor_task {
            let _ = task.await;
        }

        while let Ok(message) = self.outgoing_rx.try_recv() {
            self.publish(&message).await;
        }

        if let Err(e) = self.interface.disconnect().await {
            warn!("Error disconnecting from bus: {}", e);
        }

        info!(
            received = self.stats.messages_received,
            published = self.stats.messages_published,
            "Neptun bridge stopped"
        );
        exit
    }

    fn liveness_callback(&self) -> LivenessCallback {
        let layout = self.layout.clone();
        let tx = self.outgoing_tx.clone();
        Arc::new(move |report| {
            tx.try_send(layout.render_liveness(report))
                .map_err(|e| e.to_string())
        })
    }

    async fn subscribe_all(&mut self) -> Result<()> {
        for filter in self.layout.subscriptions() {
            self.interface.subscribe(&filter).await?;
            debug!(filter = %filter, "Subscribed");
        }
        Ok(())
    }

    /// Route one inbound message
    async fn handle_message(&mut self, message: BusMessage) {
        self.stats.messages_received += 1;
        match self.layout.classify(&message.topic) {
            Some(InboundTopic::DeviceFrame { channel, device }) => {
                self.handle_frame(&channel, &device, &message.payload).await;
            }
            Some(InboundTopic::Command { device, name }) => {
                let result = match parse_command(&name, &message.payload) {
                    Ok(request) => self.execute(&device, request).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(device = %device, command = %name, "Command refused: {}", e);
                    self.stats.commands_rejected += 1;
                }
            }
            None => trace!(topic = %message.topic, "Ignoring topic"),
        }
    }

    /// Handle one frame from a device
    ///
    /// Raw diagnostics go out for every buffer. Nothing else happens for a
    /// buffer that fails validation.
    async fn handle_frame(&mut self, channel: &str, device: &DeviceId, buf: &[u8]) {
        for message in self.layout.render_raw(device, buf) {
            self.publish(&message).await;
        }

        let frame = match Frame::validate(buf).map_err(NeptunError::from) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %device, code = e.error_code(), "Dropping frame: {}", e);
                debug!(device = %device, "Dropped frame: {}", hex::encode(buf));
                self.stats.frames_rejected += 1;
                return;
            }
        };
        self.stats.frames_accepted += 1;
        self.registry.learn_channel(device, channel);

        match frame.frame_type() {
            FrameType::SystemState => {
                let decoded = decode_system_telemetry(frame.payload());
                if let Some(reason) = decoded.rejection() {
                    warn!(device = %device, "Partial system_state: {}", reason);
                    self.stats.frames_truncated += 1;
                }
                self.registry.apply_telemetry(device, &decoded.value);
                for message in self.layout.render_system(device, &decoded.value) {
                    self.publish(&message).await;
                }
            }
            FrameType::SensorState => {
                let sensors = decode_sensor_telemetry(frame.payload());
                self.registry.touch(device);
                for message in self.layout.render_sensors(device, &sensors) {
                    self.publish(&message).await;
                }
            }
            other => {
                trace!(device = %device, frame_type = other.name(), "Frame without state");
                self.registry.touch(device);
            }
        }
    }

    /// Compose a request and hand it to the retry supervisor
    async fn execute(&mut self, device: &DeviceId, request: CommandRequest) -> Result<()> {
        match request {
            CommandRequest::Settings(change) => {
                let composed = self.composer.compose_settings(device, change)?;
                self.retry.try_issue(composed)?;
                for message in self.layout.render_echo(device, &change) {
                    self.publish(&message).await;
                }
            }
            CommandRequest::Counters(updates) => {
                let composed = self.composer.compose_counter_write(device, &updates)?;
                self.retry.try_issue(composed)?;
            }
            CommandRequest::Time(epoch) => {
                let epoch = epoch.unwrap_or_else(|| chrono::Utc::now().timestamp());
                let composed = self.composer.compose_time_set(device, epoch)?;
                self.retry.try_issue(composed)?;
            }
        }

        info!(device = %device, "Command issued");
        self.stats.commands_issued += 1;
        Ok(())
    }

    async fn publish(&mut self, message: &BusMessage) {
        match self.interface.publish(message).await {
            Ok(()) => {
                trace!("Published {}", message);
                self.stats.messages_published += 1;
            }
            Err(e) => {
                debug!(topic = %message.topic, "Publish failed: {}", e);
                self.stats.publish_errors += 1;
            }
        }
    }

    /// Reconnect with doubling delays
    async fn try_reconnect(&mut self) -> Result<()> {
        if !self.reconnect.enabled {
            return Err(NeptunError::Disconnected);
        }

        let mut attempt = 0u32;
        loop {
            let delay = self.reconnect.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                "Reconnecting to bus in {}",
                humantime::format_duration(delay)
            );
            let _ = self.interface.disconnect().await;
            tokio::time::sleep(delay).await;

            match self.interface.connect().await {
                Ok(()) => {
                    self.subscribe_all().await?;
                    self.stats.reconnects += 1;
                    info!("Reconnected to bus");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect failed: {}", e);
                    attempt += 1;
                    if self.reconnect.max_attempts != 0 && attempt >= self.reconnect.max_attempts {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LineKind;
    use crate::composer::SettingsChange;
    use crate::config::NeptunConfigBuilder;
    use crate::registry::Field;
    use crate::test_utils::{
        sensor, sensor_state_frame, with_bad_crc, with_bad_length, MockBus, SystemStateBuilder,
    };
    use std::time::Duration;

    const MAC: &str = "AABBCCDDEEFF";

    fn create_test_bridge(config: &NeptunConfig) -> (NeptunBridge<MockBus>, BridgeHandle, MockBus) {
        let bus = MockBus::new();
        let (bridge, handle) = NeptunBridge::new(bus.clone(), config).unwrap();
        (bridge, handle, bus)
    }

    async fn connected_bridge() -> (NeptunBridge<MockBus>, BridgeHandle, MockBus) {
        let (mut bridge, handle, bus) = create_test_bridge(&NeptunConfigBuilder::new().build());
        bridge.interface.connect().await.unwrap();
        (bridge, handle, bus)
    }

    fn frame_message(channel: &str, bytes: Vec<u8>) -> BusMessage {
        BusMessage::new(format!("{}/{}/from", channel, MAC), bytes, false)
    }

    #[test]
    fn test_bridge_rejects_invalid_config() {
        let config = NeptunConfigBuilder::new().topic_prefix("").build();
        assert!(NeptunBridge::new(MockBus::new(), &config).is_err());
    }

    #[tokio::test]
    async fn test_system_state_updates_registry() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let bytes = SystemStateBuilder::new()
            .flags(true, false, true, 0b0001)
            .bytes()
            .unwrap();

        bridge.handle_message(frame_message("cloud", bytes)).await;

        let device = DeviceId::new(MAC);
        let snap = bridge.registry.get(&device);
        assert!(snap.valve_open);
        assert!(snap.close_on_offline);
        assert_eq!(snap.channel.as_deref(), Some("cloud"));
        assert_eq!(bridge.stats.frames_accepted, 1);
        assert!(!bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_frame_leaves_no_trace() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let bytes = SystemStateBuilder::new()
            .flags(true, false, false, 0)
            .bytes()
            .unwrap();

        bridge
            .handle_message(frame_message("cloud", with_bad_length(&bytes)))
            .await;

        let snap = bridge.registry.get(&DeviceId::new(MAC));
        assert!(!snap.valve_open);
        assert!(snap.channel.is_none());
        assert!(snap.last_seen.is_none());
        assert_eq!(bridge.stats.frames_rejected, 1);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_bad_crc_frame_rejected() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let bytes = SystemStateBuilder::new()
            .flags(true, false, false, 0)
            .bytes()
            .unwrap();

        bridge
            .handle_message(frame_message("cloud", with_bad_crc(&bytes)))
            .await;

        assert_eq!(bridge.stats.frames_rejected, 1);
        assert_eq!(bridge.stats.frames_accepted, 0);
        assert!(bridge.registry.get(&DeviceId::new(MAC)).channel.is_none());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_commands_compose_on_each_other() {
        let (mut bridge, _handle, _bus) = connected_bridge().await;
        let bytes = SystemStateBuilder::new().flags(false, false, false, 0).bytes().unwrap();
        bridge.handle_message(frame_message("cloud", bytes)).await;

        // The retry task is not running, so nothing but composition has happened
        for (name, payload) in [("valve", "ON"), ("dry_flag", "ON")] {
            bridge
                .handle_message(BusMessage::new(
                    format!("neptun/{}/cmd/{}", MAC, name),
                    payload,
                    false,
                ))
                .await;
        }

        assert_eq!(bridge.stats.commands_issued, 2);
        let snap = bridge.registry.get(&DeviceId::new(MAC));
        assert!(snap.valve_open);
        assert!(snap.dry_flag);
        assert_eq!(snap.pending, 2);
    }

    #[tokio::test]
    async fn test_sensor_state_touches_device() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let frame = sensor_state_frame(&[sensor(2, 90, 4, false)]).unwrap();

        bridge
            .handle_message(frame_message("cloud", frame.as_bytes().to_vec()))
            .await;

        assert!(bridge.registry.get(&DeviceId::new(MAC)).last_seen.is_some());
        assert_eq!(
            bus.last_payload(&format!("neptun/{}/sensors_status/2/battery", MAC))
                .as_deref(),
            Some("90")
        );
    }

    #[tokio::test]
    async fn test_command_without_destination_is_refused() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let device = DeviceId::new(MAC);

        let result = bridge
            .execute(&device, CommandRequest::Settings(SettingsChange::Valve(false)))
            .await;

        assert!(matches!(result, Err(NeptunError::DestinationUnknown { .. })));
        assert_eq!(bridge.stats.commands_issued, 0);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_settings_command_echoes_intent() {
        let (mut bridge, _handle, bus) = connected_bridge().await;
        let bytes = SystemStateBuilder::new().flags(true, false, false, 0).bytes().unwrap();
        bridge.handle_message(frame_message("cloud", bytes)).await;
        bus.clear_published();

        bridge
            .handle_message(BusMessage::new(
                format!("neptun/{}/cmd/line_2_type", MAC),
                "counter",
                false,
            ))
            .await;

        assert_eq!(bridge.stats.commands_issued, 1);
        assert_eq!(
            bus.last_payload(&format!("neptun/{}/settings/lines_in/line_2", MAC))
                .as_deref(),
            Some(LineKind::Counter.as_str())
        );
    }

    #[tokio::test]
    async fn test_unknown_command_counted() {
        let (mut bridge, _handle, _bus) = connected_bridge().await;
        bridge
            .handle_message(BusMessage::new(
                format!("neptun/{}/cmd/self_destruct", MAC),
                "1",
                false,
            ))
            .await;
        assert_eq!(bridge.stats.commands_rejected, 1);
    }

    #[tokio::test]
    async fn test_cloud_prefix_filters_frames() {
        let config = NeptunConfigBuilder::new().cloud_prefix("cloud").build();
        let (mut bridge, _handle, bus) = create_test_bridge(&config);
        bridge.interface.connect().await.unwrap();

        let bytes = SystemStateBuilder::new().flags(true, false, false, 0).bytes().unwrap();
        bridge.handle_message(frame_message("elsewhere", bytes)).await;

        assert_eq!(bridge.stats.frames_accepted, 0);
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_bus_closes() {
        let (bridge, handle, bus) = create_test_bridge(&NeptunConfigBuilder::new().build());
        let bytes = SystemStateBuilder::new().flags(false, false, false, 0).bytes().unwrap();
        bus.inject_frame("cloud", MAC, &bytes);
        bus.close_incoming();

        bridge.run().await.unwrap();

        assert_eq!(bus.subscriptions().len(), 2);
        assert!(!bus.is_connected());
        assert!(handle.stats().await.is_err());
        assert!(!bus
            .published_matching(&format!("neptun/{}/#", MAC))
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconnects_after_read_error() {
        let (bridge, handle, bus) = create_test_bridge(&NeptunConfigBuilder::new().build());
        bus.fail_next_read();
        let task = tokio::spawn(bridge.run());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.interface_errors, 1);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(bus.connect_count(), 2);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_without_reconnect_stops() {
        let config = NeptunConfigBuilder::new().auto_reconnect(false).build();
        let (bridge, _handle, bus) = create_test_bridge(&config);
        bus.fail_next_read();

        let result = bridge.run().await;
        assert!(matches!(result, Err(NeptunError::Disconnected)));
        assert_eq!(bus.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_through_handle() {
        let (bridge, handle, bus) = create_test_bridge(&NeptunConfigBuilder::new().build());
        let task = tokio::spawn(bridge.run());
        let device = DeviceId::new(MAC);

        let refused = handle
            .request(device.clone(), CommandRequest::Settings(SettingsChange::DryFlag(true)))
            .await;
        assert!(matches!(refused, Err(NeptunError::DestinationUnknown { .. })));

        let bytes = SystemStateBuilder::new().flags(true, false, false, 0).bytes().unwrap();
        bus.inject_frame("cloud", MAC, &bytes);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut outcomes = handle.subscribe_outcomes();
        handle
            .request(device.clone(), CommandRequest::Settings(SettingsChange::DryFlag(true)))
            .await
            .unwrap();

        let report = outcomes.recv().await.unwrap();
        assert_eq!(report.field, Field::DryFlag);
        assert_eq!(report.attempts, 3);
        assert_eq!(bus.published_on(&format!("cloud/{}/to", MAC)).len(), 3);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
