//! Core types for the 4D daemon control protocol.
//!
//! This crate defines the message envelope exchanged between daemons, its
//! routing key, correlation tokens, configuration structs and shared error
//! types. It performs no I/O; the transport lives in `fourd-wire` and the
//! dispatch/recovery logic in `fourd-kernel`.

pub mod config;
pub mod envelope;
pub mod error;

pub use config::ControlConfig;
pub use envelope::{CommandPath, Envelope, SendState, Token, RESULT_OK};
pub use error::EnvelopeError;
