//! Kernel-specific error types.

use fourd_types::EnvelopeError;
use fourd_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping transport and envelope errors.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A reply arrived with a non-success `ResultCode`.
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// No `[daemons.<name>]` entry.
    #[error("Unknown daemon '{0}'")]
    UnknownDaemon(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Restart failed: {0}")]
    RestartFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
