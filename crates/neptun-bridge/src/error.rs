//! Error types for Neptun bridge operations
//!
//! This module provides error handling for the frame codec, command
//! composition, configuration and the bus transport. Nothing in here is
//! process-fatal: frames are dropped with a log line, commands are refused
//! synchronously, and transport errors feed the reconnect loop.

use thiserror::Error;

use crate::codec::RejectReason;

/// Main error type for Neptun bridge operations
#[derive(Error, Debug)]
pub enum NeptunError {
    // ===== Protocol Errors =====
    /// Frame failed validation and was discarded
    #[error("Frame rejected: {0}")]
    FrameRejected(RejectReason),

    /// Frame type is valid on the wire but not handled by this operation
    #[error("Unexpected frame type 0x{got:02X} (expected 0x{expected:02X})")]
    UnexpectedFrameType {
        /// Type code that was expected
        expected: u8,
        /// Type code found in the frame
        got: u8,
    },

    /// Command frame could not be parsed back into a known command
    #[error("Malformed command frame: {0}")]
    MalformedCommand(String),

    // ===== Command Errors =====
    /// A command parameter is out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No outbound destination is known for the device
    #[error("No destination known for device {device}")]
    DestinationUnknown {
        /// Device identifier
        device: String,
    },

    /// Command topic or payload not understood
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== Transport Errors =====
    /// Bus read error
    #[error("Bus read error: {0}")]
    ReadError(String),

    /// Bus write error
    #[error("Bus write error: {0}")]
    WriteError(String),

    /// Bus disconnected
    #[error("Bus disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Service Errors =====
    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NeptunError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NeptunError::ConnectionTimeout { .. }
                | NeptunError::Disconnected
                | NeptunError::ReadError(_)
                | NeptunError::WriteError(_)
        )
    }

    /// Check if this is a protocol error (bad data from a device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            NeptunError::FrameRejected(_)
                | NeptunError::UnexpectedFrameType { .. }
                | NeptunError::MalformedCommand(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            NeptunError::FrameRejected(reason) => reason.code(),
            NeptunError::UnexpectedFrameType { .. } => "UNEXPECTED_FRAME_TYPE",
            NeptunError::MalformedCommand(_) => "MALFORMED_COMMAND",
            NeptunError::InvalidParameter(_) => "INVALID_PARAMETER",
            NeptunError::DestinationUnknown { .. } => "DESTINATION_UNKNOWN",
            NeptunError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            NeptunError::InvalidConfig(_) => "INVALID_CONFIG",
            NeptunError::MissingConfig(_) => "MISSING_CONFIG",
            NeptunError::ReadError(_) => "READ_ERROR",
            NeptunError::WriteError(_) => "WRITE_ERROR",
            NeptunError::Disconnected => "DISCONNECTED",
            NeptunError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            NeptunError::ChannelError(_) => "CHANNEL_ERROR",
            NeptunError::ChannelClosed => "CHANNEL_CLOSED",
            NeptunError::Json(_) => "JSON_ERROR",
            NeptunError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<RejectReason> for NeptunError {
    fn from(reason: RejectReason) -> Self {
        NeptunError::FrameRejected(reason)
    }
}

/// Result type alias for Neptun operations
pub type Result<T> = std::result::Result<T, NeptunError>;

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NeptunError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NeptunError::ChannelError(err.to_string())
    }
}
