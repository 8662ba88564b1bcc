//! Client role: one outbound connection.
//!
//! A [`Connection`] holds one outbound TCP stream. `connect` starts a single
//! reader task that hands each frame body to the [`MessageHandler`]; `send`
//! may be called concurrently from any task and writes whole frames through a
//! reusable buffer.
//!
//! There is no reconnect logic here. When the reader hits a frame or socket
//! error it closes the stream and marks the connection disconnected; callers
//! that want to reconnect do so themselves, usually through a retry policy.

use crate::error::{FrameError, WireError};
use crate::frame;
use crate::handler::{deliver, FrameSink, MessageContext, MessageHandler};
use crate::listener::shutdown_signalled;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state, changed only by the connect, read, write and close paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Default)]
struct WriterSlot {
    half: Option<OwnedWriteHalf>,
    /// Reused across sends.
    buf: Vec<u8>,
}

struct Inner {
    state: AtomicU8,
    peer: Mutex<Option<SocketAddr>>,
    writer: tokio::sync::Mutex<WriterSlot>,
    reader: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
    join_timeout: Duration,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Puts a claimed `Connecting` state back to `Disconnected` unless committed.
struct ConnectingGuard<'a> {
    inner: &'a Inner,
    committed: bool,
}

impl<'a> ConnectingGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self {
            inner,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

/// An outbound control connection. Cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Connection {
    /// `join_timeout` bounds how long `close` waits for the reader task.
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                peer: Mutex::new(None),
                writer: tokio::sync::Mutex::new(WriterSlot::default()),
                reader: Mutex::new(None),
                join_timeout,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the read and write paths last saw the stream healthy.
    ///
    /// The peer may already be gone; the next read or write will notice.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect within `timeout` and start the reader task.
    ///
    /// Succeeds immediately if already connected. On failure no task is
    /// started and the connection stays disconnected.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn MessageHandler>,
        timeout: Duration,
    ) -> Result<(), WireError> {
        let claimed = self.inner.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match claimed.map_err(ConnectionState::from_u8) {
            Ok(_) => {}
            Err(ConnectionState::Connected) => {
                debug!(host, port, "Already connected");
                return Ok(());
            }
            Err(_) => {
                return Err(WireError::Connect("connect already in progress".into()));
            }
        }

        // Dropped on every early return, including cancellation of this future.
        let mut pending = ConnectingGuard::new(&self.inner);

        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(WireError::Connect(format!("{addr}: {e}"))),
            Err(_) => return Err(WireError::ConnectTimeout { addr }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        self.inner.writer.lock().await.half = Some(writer);
        *self.inner.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);

        // Set before the reader starts so its teardown cannot be overwritten.
        pending.commit();
        self.inner.set_state(ConnectionState::Connected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(self.clone(), peer, reader, handler, stop_rx));
        *self.inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some((task, stop_tx));
        info!(peer = %peer, "Connected");
        Ok(())
    }

    /// Frame and write one body. Fails on a short or broken write.
    pub async fn send(&self, body: &str) -> Result<(), WireError> {
        if !self.is_connected() {
            return Err(WireError::NotConnected);
        }
        let mut slot = self.inner.writer.lock().await;
        let WriterSlot { half, buf } = &mut *slot;
        let writer = half.as_mut().ok_or(WireError::NotConnected)?;

        buf.clear();
        frame::encode_into(body.as_bytes(), buf)?;
        if let Err(e) = writer.write_all(&buf[..]).await {
            *half = None;
            self.inner.set_state(ConnectionState::Disconnected);
            warn!(peer = ?self.peer_addr(), error = %e, "Send failed, connection dropped");
            return Err(WireError::Send(e.to_string()));
        }
        debug!(len = body.len(), "Frame sent");
        Ok(())
    }

    /// Close the stream and wait (bounded) for the reader task to finish.
    pub async fn close(&self) {
        self.inner.set_state(ConnectionState::Disconnected);
        if let Some(mut writer) = self.inner.writer.lock().await.half.take() {
            let _ = writer.shutdown().await;
        }

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((task, stop)) = reader {
            stop.send_replace(true);
            let abort = task.abort_handle();
            if tokio::time::timeout(self.inner.join_timeout, task).await.is_err() {
                warn!("Reader task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

#[async_trait]
impl FrameSink for Connection {
    async fn send_text(&self, body: &str) -> Result<(), WireError> {
        self.send(body).await
    }
}

async fn read_loop(
    conn: Connection,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let sink: Arc<dyn FrameSink> = Arc::new(conn.clone());
    let ctx = MessageContext::new(peer, None, sink);

    loop {
        let frame = tokio::select! {
            _ = shutdown_signalled(&mut stop) => return,
            frame = frame::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(body) => {
                debug!(peer = %peer, len = body.len(), "Frame received");
                deliver(handler.as_ref(), &ctx, body).await;
            }
            Err(FrameError::Closed) => {
                info!(peer = %peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
        }
    }

    conn.inner.set_state(ConnectionState::Disconnected);
    if let Some(mut writer) = conn.inner.writer.lock().await.half.take() {
        let _ = writer.shutdown().await;
    }
}
