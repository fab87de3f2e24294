//! Bridge between Neptun AquaControl leak controllers and a local message bus
//!
//! Neptun controllers talk to their vendor cloud in small binary frames. When
//! that traffic is redirected onto a local MQTT-style bus, this crate decodes
//! the device frames into per-field topics, and turns command requests on the
//! bus back into frames the device accepts.
//!
//! # Architecture
//!
//! 1. **Codec** - frame validation, TLV walking, telemetry decoding, command encoding
//! 2. **State** - per-device registry with telemetry-confirmed and speculative values
//! 3. **Control** - command composition, retry until confirmed, liveness watchdog
//! 4. **Bus** - topic layout, transports, and the event loop tying it together
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use neptun_bridge::{NeptunBridge, NeptunConfigBuilder, StdioInterface};
//!
//! #[tokio::main]
//! async fn main() -> neptun_bridge::Result<()> {
//!     let config = NeptunConfigBuilder::new()
//!         .topic_prefix("neptun")
//!         .cloud_prefix("cloud")
//!         .build();
//!
//!     let (bridge, _handle) = NeptunBridge::new(StdioInterface::stdio(), &config)?;
//!     bridge.run().await
//! }
//! ```
//!
//! # Features
//!
//! - `stdio` - line-oriented transport over stdin/stdout (default)
//!
//! # Message Flow
//!
//! ## Device → bus
//!
//! 1. A frame arrives on `<channel>/<mac>/from`
//! 2. [`Frame::validate`] checks signature, length and CRC
//! 3. The `system_state` or `sensor_state` payload is decoded, possibly partially
//! 4. [`DeviceRegistry`] confirms the reported values and learns the channel
//! 5. [`TopicLayout`] renders them under `<prefix>/<mac>/...`
//!
//! ## Bus → device
//!
//! 1. A request arrives on `<prefix>/<mac>/cmd/<name>`
//! 2. [`CommandComposer`] merges it into the cached settings and frames it
//! 3. [`RetrySupervisor`] sends it to `<channel>/<mac>/to` and resends until
//!    telemetry confirms the value or attempts run out
//! 4. The outcome is published on `<prefix>/<mac>/cmd/<field>/result`

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Phase 1: Core modules
pub mod codec;
pub mod config;
pub mod error;

// Phase 2: Device state and control
pub mod composer;
pub mod registry;
pub mod retry;
pub mod watchdog;

// Phase 3: Bus integration
pub mod bridge;
pub mod interface;
pub mod topics;

// Phase 4: Testing utilities
pub mod test_utils;

// Re-exports for convenience - Phase 1
pub use codec::{
    crc16_ccitt, decode_sensor_telemetry, decode_system_telemetry, Command, CommandKind, Frame,
    FrameType, LineIndex, LineKind, RejectReason, SensorReport, SystemTelemetry,
};
pub use config::{
    BridgeConfig, LivenessConfig, NeptunConfig, NeptunConfigBuilder, ReconnectConfig,
    RetryConfig, TopicConfig,
};
pub use error::{NeptunError, Result};

// Re-exports for convenience - Phase 2
pub use composer::{
    CommandComposer, ComposedCommand, CounterUpdate, PendingChange, SettingsChange,
};
pub use registry::{DeviceId, DeviceRegistry, DeviceSnapshot, Field, FieldValue};
pub use retry::{
    ExhaustReason, Outbound, RetryHandle, RetryOutcome, RetryReport, RetryStats, RetrySupervisor,
};
pub use watchdog::{LivenessReport, LivenessWatchdog};

// Re-exports for convenience - Phase 3
pub use bridge::{BridgeHandle, BridgeStats, NeptunBridge};
pub use interface::{BusInterface, BusMessage, ConnectionState};
pub use topics::{parse_command, CommandRequest, InboundTopic, TopicLayout};

#[cfg(feature = "stdio")]
pub use interface::{LineInterface, StdioInterface};

// Re-exports for convenience - Phase 4 (testing)
pub use test_utils::{MockBus, SystemStateBuilder, TestFixture};

// Protocol constants re-exports
pub use codec::{BRIDGE_SOURCE_MARKER, FRAME_SIGNATURE, LINE_COUNT};
pub use config::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_SPACING, DEFAULT_TOPIC_PREFIX};
pub use registry::DEFAULT_LOST_TIMEOUT;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
