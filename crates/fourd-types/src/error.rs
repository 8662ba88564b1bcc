//! Shared error types.

use thiserror::Error;

/// Errors produced while decoding or validating an [`Envelope`](crate::Envelope).
///
/// These are message-local: a connection that receives a malformed envelope
/// logs and discards it, it never tears the session down.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The body is not valid JSON, or a field has the wrong JSON type.
    #[error("Invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The body parsed but is not a JSON object.
    #[error("Envelope body is not a JSON object")]
    NotAnObject,

    /// A required key is absent.
    #[error("Envelope is missing required key '{0}'")]
    MissingField(&'static str),

    /// A required key is present but empty or whitespace-only.
    #[error("Envelope key '{0}' is blank")]
    BlankField(&'static str),

    /// `SendState` holds something other than request/response/notify.
    #[error("Unknown SendState '{0}'")]
    UnknownSendState(String),

    /// A command path string did not have exactly three segments.
    #[error("Invalid command path '{0}': expected Section1/Section2/Section3")]
    InvalidCommandPath(String),
}
