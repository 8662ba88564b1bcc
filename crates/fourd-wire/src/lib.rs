//! 4D control-protocol transport.
//!
//! Length-framed TCP messaging between daemons: a frame codec, a client
//! [`Connection`], a server [`Listener`] with a session table, and a
//! [`PortRegistry`] that lets several listener constructions in one process
//! share a port.
//!
//! ## Architecture
//!
//! - **frame**: `[u32 LE length][u8 flag][body]` encode/decode with a 64 MiB cap
//! - **Connection**: one outbound stream, one reader task, concurrent sends
//! - **Listener**: accept task plus a reader and writer task per session
//! - **PortRegistry**: port → owning listener; later constructions are aliases
//! - **MessageHandler**: the callback both roles deliver frame bodies to

pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod roundtrip;

pub use connection::{Connection, ConnectionState};
pub use error::{FrameError, HandlerError, WireError};
pub use handler::{FrameSink, MessageContext, MessageHandler};
pub use listener::{Listener, ListenerState, SessionId};
pub use registry::PortRegistry;
pub use roundtrip::roundtrip;
