//! Bus transports
//!
//! The bridge talks to the local message bus through [`BusInterface`]. The
//! broker connection itself lives outside this crate; implementations here
//! only carry topic/payload pairs.
//!
//! - [`stdio::LineInterface`] - tab-separated lines over any async reader and
//!   writer, with [`stdio::StdioInterface`] bound to stdin/stdout (requires
//!   the `stdio` feature)

#[cfg(feature = "stdio")]
pub mod stdio;

#[cfg(feature = "stdio")]
pub use stdio::{LineInterface, StdioInterface};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// One message on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Full topic
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
    /// Ask the broker to keep the last value
    pub retain: bool,
}

impl BusMessage {
    /// Create a message
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Payload as UTF-8 text, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes", self.topic, self.payload.len())?;
        if self.retain {
            write!(f, ", retained")?;
        }
        write!(f, ")")
    }
}

/// Trait for bus transports
///
/// `read_message` must be cancel safe: the bridge polls it inside
/// `tokio::select!` next to its other event sources.
#[async_trait]
pub trait BusInterface: Send + Sync {
    /// Connect to the bus
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the bus
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Register interest in a topic filter (`+` and `#` wildcards)
    async fn subscribe(&mut self, _filter: &str) -> Result<()> {
        Ok(())
    }

    /// Wait for the next inbound message
    ///
    /// Returns `None` when the bus has closed for good.
    /// Returns `Err` on connection/read errors.
    async fn read_message(&mut self) -> Result<Option<BusMessage>>;

    /// Publish a message
    async fn publish(&mut self, message: &BusMessage) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Successfully connected
    Connected,
    /// Connection lost, may reconnect
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Check an MQTT-style topic filter against a concrete topic
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
