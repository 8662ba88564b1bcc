//! The callback seam between the transport and the application.
//!
//! Both [`Connection`](crate::Connection) and [`Listener`](crate::Listener)
//! hand every decoded frame body to a [`MessageHandler`]. The handler gets a
//! [`MessageContext`] through which it can write back to the same peer.

use crate::error::{HandlerError, WireError};
use crate::listener::SessionId;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Something a handler can write a reply into.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Frame and send one text body to the peer this sink belongs to.
    async fn send_text(&self, body: &str) -> Result<(), WireError>;
}

/// Where an inbound message came from and how to answer it.
#[derive(Clone)]
pub struct MessageContext {
    pub peer: SocketAddr,
    /// Set for messages received by a listener session.
    pub session: Option<SessionId>,
    sink: Arc<dyn FrameSink>,
}

impl MessageContext {
    pub fn new(peer: SocketAddr, session: Option<SessionId>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            peer,
            session,
            sink,
        }
    }

    /// Send a body back to the originating peer.
    pub async fn reply(&self, body: &str) -> Result<(), WireError> {
        self.sink.send_text(body).await
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("peer", &self.peer)
            .field("session", &self.session)
            .finish()
    }
}

/// Receives every frame body read by a connection or session.
///
/// Calls for one connection are sequential; calls for different connections
/// may run concurrently, so implementations must be `Sync`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, ctx: &MessageContext, body: String) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_message(&self, ctx: &MessageContext, body: String) -> Result<(), HandlerError> {
        (self)(ctx.clone(), body).await
    }
}

/// Run the handler for one frame, containing errors and panics.
///
/// Neither outcome is allowed to end the caller's read loop.
pub(crate) async fn deliver(handler: &dyn MessageHandler, ctx: &MessageContext, body: Vec<u8>) {
    let text = match String::from_utf8(body) {
        Ok(text) => text,
        Err(e) => {
            debug!(peer = %ctx.peer, error = %e, "Dropping non-UTF-8 frame");
            return;
        }
    };

    match AssertUnwindSafe(handler.on_message(ctx, text))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(peer = %ctx.peer, session = ?ctx.session, error = %e, "Message handler failed");
        }
        Err(_) => {
            error!(peer = %ctx.peer, session = ?ctx.session, "Message handler panicked");
        }
    }
}
