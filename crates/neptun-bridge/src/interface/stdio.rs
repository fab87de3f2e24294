//! Line-oriented bus transport
//!
//! Each message is one line:
//!
//! ```text
//! <topic>\t<payload>[\tr]
//! ```
//!
//! Payloads on device frame topics (`.../from`, `.../to`) are hex, since
//! frames are binary; every other payload is UTF-8 text. A trailing `r`
//! field marks a retained message. Lines that cannot be parsed are logged
//! and skipped. End of input closes the bus.

use crate::error::{NeptunError, Result};
use crate::interface::{BusInterface, BusMessage, ConnectionState};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, info, trace, warn};

const RETAIN_MARKER: &str = "r";

/// Bus transport over an async line reader and writer
pub struct LineInterface<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    state: ConnectionState,
    name: String,
}

/// [`LineInterface`] bound to the process stdin/stdout
pub type StdioInterface = LineInterface<tokio::io::Stdin, tokio::io::Stdout>;

impl StdioInterface {
    /// Create over stdin/stdout
    pub fn stdio() -> Self {
        LineInterface::new(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }
}

impl<R, W> LineInterface<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create over any reader/writer pair
    pub fn new(reader: R, writer: W, name: impl Into<String>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            state: ConnectionState::Disconnected,
            name: name.into(),
        }
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

fn is_frame_topic(topic: &str) -> bool {
    topic.ends_with("/from") || topic.ends_with("/to")
}

/// Parse one line into a message
pub fn parse_line(line: &str) -> Result<BusMessage> {
    let mut fields = line.split('\t');
    let topic = fields
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| NeptunError::ReadError("line without topic".to_string()))?;
    let raw = fields.next().unwrap_or("");
    let retain = fields.next() == Some(RETAIN_MARKER);

    let payload = if is_frame_topic(topic) {
        Bytes::from(
            hex::decode(raw.trim())
                .map_err(|e| NeptunError::ReadError(format!("bad hex on {}: {}", topic, e)))?,
        )
    } else {
        Bytes::from(raw.to_string())
    };

    Ok(BusMessage {
        topic: topic.to_string(),
        payload,
        retain,
    })
}

/// Render a message as one line, without the trailing newline
pub fn format_line(message: &BusMessage) -> String {
    let payload = if is_frame_topic(&message.topic) {
        hex::encode(&message.payload)
    } else {
        // Tabs and newlines would break the framing
        message
            .payload_str()
            .replace(['\t', '\n', '\r'], " ")
    };

    if message.retain {
        format!("{}\t{}\t{}", message.topic, payload, RETAIN_MARKER)
    } else {
        format!("{}\t{}", message.topic, payload)
    }
}

#[async_trait]
impl<R, W> BusInterface for LineInterface<R, W>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connected;
        info!(interface = %self.name, "Line transport ready");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            self.writer
                .flush()
                .await
                .map_err(|e| NeptunError::WriteError(format!("Flush failed: {}", e)))?;
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        // Every line on the input is delivered; the bridge filters by topic
        debug!(interface = %self.name, filter, "Subscribed");
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<BusMessage>> {
        if self.state != ConnectionState::Connected {
            return Err(NeptunError::Disconnected);
        }

        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!(interface = %self.name, "End of input");
                    self.state = ConnectionState::Disconnected;
                    return Ok(None);
                }
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(NeptunError::ReadError(e.to_string()));
                }
            };

            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(message) => {
                    trace!(topic = %message.topic, "Read line");
                    return Ok(Some(message));
                }
                Err(e) => warn!(interface = %self.name, "Skipping line: {}", e),
            }
        }
    }

    async fn publish(&mut self, message: &BusMessage) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(NeptunError::Disconnected);
        }

        let mut line = format_line(message);
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| NeptunError::WriteError(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| NeptunError::WriteError(format!("Flush failed: {}", e)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<R, W> std::fmt::Debug for LineInterface<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineInterface")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}
