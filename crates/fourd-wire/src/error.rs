//! Transport error types.

use fourd_types::EnvelopeError;
use thiserror::Error;

/// Failures while reading or writing a single frame.
///
/// Any of these is fatal for the connection it occurred on, and only that
/// connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly at a frame boundary.
    #[error("Connection closed")]
    Closed,
    /// The peer closed the stream mid-header or mid-body.
    #[error("Truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("Frame too large: {len} bytes (max {max})")]
    TooLarge { len: u64, max: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("Not connected")]
    NotConnected,
    /// The listener was closed and cannot be reopened.
    #[error("Listener closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// A session's outbound queue was full; the frame was not queued.
    #[error("Outbound queue full for session {0}")]
    QueueFull(u64),
    #[error("Operation timed out")]
    Timeout,
    #[error(transparent)]
    Decode(#[from] EnvelopeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure raised by a [`MessageHandler`](crate::MessageHandler).
///
/// Logged at the session boundary; the session keeps reading.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] EnvelopeError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
