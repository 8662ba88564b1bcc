//! Server role: the listener.
//!
//! A [`Listener`] binds one TCP port and accepts any number of sessions. Each
//! session gets a reader task, which decodes frames and hands them to the
//! [`MessageHandler`] strictly in arrival order, and a writer task draining a
//! bounded outbound queue. Writes to one session never wait on another.
//!
//! Sessions live in a table keyed by [`SessionId`]; a session removes itself
//! when its peer disconnects, when a frame error occurs, or when the listener
//! shuts down. Handler errors and panics are logged and the session keeps
//! reading.
//!
//! If the port is already bound by someone else, `open` does not fail: the
//! listener parks in [`ListenerState::Paused`] until it is closed.

use crate::error::{FrameError, WireError};
use crate::frame;
use crate::handler::{deliver, FrameSink, MessageContext, MessageHandler};
use crate::registry::PortRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use fourd_types::config::ListenerConfig;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Identifies one accepted connection for the lifetime of its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of the owning listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, not yet opened.
    Idle,
    Listening,
    /// The port was taken; waiting to be closed.
    Paused,
    Closed,
}

struct SessionEntry {
    peer: SocketAddr,
    outbound: mpsc::Sender<Arc<[u8]>>,
}

/// State shared between a listener, its aliases and its tasks.
pub(crate) struct ListenerShared {
    config: ListenerConfig,
    handler: Arc<dyn MessageHandler>,
    sessions: DashMap<SessionId, SessionEntry>,
    next_session: AtomicU64,
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerShared {
    fn new(config: ListenerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            handler,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            state: Mutex::new(ListenerState::Idle),
            local_addr: Mutex::new(None),
            shutdown,
            accept_task: Mutex::new(None),
        }
    }

    fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// A TCP server for control traffic.
pub struct Listener {
    shared: Arc<ListenerShared>,
    alias: bool,
    registry: PortRegistry,
}

impl Listener {
    /// Create a listener for `config.port`, or an alias of the listener that
    /// already owns that port in `registry`.
    ///
    /// An alias ignores its own `config` and `handler`.
    pub fn new(
        config: ListenerConfig,
        handler: Arc<dyn MessageHandler>,
        registry: &PortRegistry,
    ) -> Self {
        let port = config.port;
        let (shared, alias) =
            registry.claim(port, || Arc::new(ListenerShared::new(config, handler)));
        if alias {
            info!(port, "Port already has a listener in this process, using alias");
        }
        Self {
            shared,
            alias,
            registry: registry.clone(),
        }
    }

    pub fn is_alias(&self) -> bool {
        self.alias
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    /// The bound address once listening (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live session count.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Snapshot of live sessions and their peers, ordered by id.
    pub fn sessions(&self) -> Vec<(SessionId, SocketAddr)> {
        let mut list: Vec<_> = self
            .shared
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().peer))
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    /// Bind and start accepting. A no-op on aliases and on an open listener.
    ///
    /// A port conflict parks the listener in [`ListenerState::Paused`] and
    /// returns `Ok`; any other bind failure is returned.
    pub async fn open(&self) -> Result<(), WireError> {
        if self.alias {
            debug!(port = self.shared.config.port, "open() on alias ignored");
            return Ok(());
        }
        match self.shared.state() {
            ListenerState::Idle => {}
            ListenerState::Listening | ListenerState::Paused => return Ok(()),
            ListenerState::Closed => return Err(WireError::Closed),
        }

        let host = self.shared.config.host.as_str();
        let port = self.shared.config.port;
        let addr_text = format!("{host}:{port}");
        let addr = tokio::net::lookup_host(addr_text.as_str())
            .await
            .map_err(|source| WireError::Bind {
                addr: addr_text.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| WireError::Bind {
                addr: addr_text.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                ),
            })?;

        let task = match bind(addr) {
            Ok(listener) => {
                let local = listener.local_addr()?;
                *self.shared.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
                self.shared.set_state(ListenerState::Listening);
                info!(addr = %local, "Listener accepting connections");
                tokio::spawn(accept_loop(Arc::clone(&self.shared), listener))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(
                    addr = %addr,
                    "Port already in use, listener paused until closed"
                );
                self.shared.set_state(ListenerState::Paused);
                let mut shutdown = self.shared.shutdown.subscribe();
                tokio::spawn(async move { shutdown_signalled(&mut shutdown).await })
            }
            Err(source) => {
                return Err(WireError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        };

        *self.shared.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    /// Queue `body` for every live session, or for the first session whose
    /// peer IP is `target`. Returns how many sessions it was queued for.
    ///
    /// Broadcast never waits: a session whose queue is full is skipped and
    /// logged. A targeted send reports the failure instead.
    pub fn send(&self, body: &str, target: Option<IpAddr>) -> Result<usize, WireError> {
        let frame: Arc<[u8]> = frame::encode(body.as_bytes())?.into();

        match target {
            Some(ip) => {
                let (id, outbound) = self
                    .shared
                    .sessions
                    .iter()
                    .filter(|e| e.value().peer.ip() == ip)
                    .min_by_key(|e| *e.key())
                    .map(|e| (*e.key(), e.value().outbound.clone()))
                    .ok_or(WireError::NotConnected)?;
                enqueue(id, &outbound, frame)?;
                Ok(1)
            }
            None => {
                let targets: Vec<(SessionId, mpsc::Sender<Arc<[u8]>>)> = self
                    .shared
                    .sessions
                    .iter()
                    .map(|e| (*e.key(), e.value().outbound.clone()))
                    .collect();
                let mut queued = 0;
                for (id, outbound) in targets {
                    match enqueue(id, &outbound, Arc::clone(&frame)) {
                        Ok(()) => queued += 1,
                        Err(e) => warn!(session = %id, error = %e, "Broadcast skipped session"),
                    }
                }
                debug!(sessions = queued, len = body.len(), "Broadcast queued");
                Ok(queued)
            }
        }
    }

    /// Queue `body` for one session by id.
    pub fn send_to_session(&self, id: SessionId, body: &str) -> Result<(), WireError> {
        let outbound = self
            .shared
            .sessions
            .get(&id)
            .map(|e| e.value().outbound.clone())
            .ok_or(WireError::NotConnected)?;
        enqueue(id, &outbound, frame::encode(body.as_bytes())?.into())
    }

    /// Stop accepting, end every session and release the port.
    ///
    /// Sessions get `join_timeout` each to finish; stragglers are aborted.
    /// A no-op on aliases.
    pub async fn close(&self) {
        if self.alias {
            debug!(port = self.shared.config.port, "close() on alias ignored");
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ListenerState::Closed {
                return;
            }
            *state = ListenerState::Closed;
        }

        self.shared.shutdown.send_replace(true);

        let task = self
            .shared
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            let budget = self.shared.config.accept_join_timeout();
            if tokio::time::timeout(budget, task).await.is_err() {
                warn!(port = self.shared.config.port, "Accept task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.sessions.clear();
        self.registry.release(self.shared.config.port, &self.shared);
        info!(port = self.shared.config.port, "Listener closed");
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.shared.config.port)
            .field("alias", &self.alias)
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// An owner dropped without [`Listener::close`] still stops accepting and
/// frees its port entry; the accept task winds down in the background.
impl Drop for Listener {
    fn drop(&mut self) {
        if self.alias {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ListenerState::Closed {
                return;
            }
            *state = ListenerState::Closed;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.sessions.clear();
        self.registry.release(self.shared.config.port, &self.shared);
        debug!(port = self.shared.config.port, "Listener dropped without close");
    }
}

fn enqueue(
    id: SessionId,
    outbound: &mpsc::Sender<Arc<[u8]>>,
    frame: Arc<[u8]>,
) -> Result<(), WireError> {
    outbound.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => WireError::QueueFull(id.0),
        mpsc::error::TrySendError::Closed(_) => WireError::Send(format!("session {id} closed")),
    })
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Still refuses a second live listener on the same port.
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Resolve once `rx` carries `true` or its sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn accept_loop(shared: Arc<ListenerShared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_session(&shared, &mut sessions, stream, peer),
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);

    // Sessions observe the same shutdown signal.
    let budget = shared.config.join_timeout();
    while !sessions.is_empty() {
        match tokio::time::timeout(budget, sessions.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(remaining = sessions.len(), "Sessions did not stop in time, aborting");
                sessions.abort_all();
                break;
            }
        }
    }
}

fn spawn_session(
    shared: &Arc<ListenerShared>,
    sessions: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let id = SessionId(shared.next_session.fetch_add(1, Ordering::Relaxed));
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session = %id, error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(shared.config.session_queue.max(1));

    shared.sessions.insert(
        id,
        SessionEntry {
            peer,
            outbound: tx.clone(),
        },
    );
    info!(session = %id, peer = %peer, sessions = shared.sessions.len(), "Session opened");

    let shutdown = shared.shutdown.subscribe();
    sessions.spawn(run_session(
        Arc::clone(shared),
        id,
        peer,
        reader,
        writer,
        tx,
        rx,
        shutdown,
    ));
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    shared: Arc<ListenerShared>,
    id: SessionId,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound: mpsc::Sender<Arc<[u8]>>,
    rx: mpsc::Receiver<Arc<[u8]>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (stop_tx, stop_rx) = oneshot::channel();
    let write_task = tokio::spawn(write_loop(id, writer, rx, stop_rx));
    let ctx = MessageContext::new(peer, Some(id), Arc::new(SessionSink { id, outbound }));

    loop {
        let frame = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            frame = frame::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(body) => {
                debug!(session = %id, len = body.len(), "Frame received");
                deliver(shared.handler.as_ref(), &ctx, body).await;
            }
            Err(FrameError::Closed) => {
                debug!(session = %id, peer = %peer, "Peer closed session");
                break;
            }
            Err(e) => {
                warn!(session = %id, peer = %peer, error = %e, "Session read failed");
                break;
            }
        }
    }

    shared.sessions.remove(&id);
    drop(ctx);
    let _ = stop_tx.send(());
    let abort = write_task.abort_handle();
    if tokio::time::timeout(shared.config.join_timeout(), write_task)
        .await
        .is_err()
    {
        abort.abort();
    }
    info!(session = %id, peer = %peer, sessions = shared.sessions.len(), "Session closed");
}

async fn write_loop(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<[u8]>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = &mut stop => {
                // Flush what was queued before the reader ended.
                while let Ok(frame) = rx.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(session = %id, error = %e, "Session write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Reply path for handlers invoked by a session.
struct SessionSink {
    id: SessionId,
    outbound: mpsc::Sender<Arc<[u8]>>,
}

#[async_trait]
impl FrameSink for SessionSink {
    async fn send_text(&self, body: &str) -> Result<(), WireError> {
        let frame: Arc<[u8]> = frame::encode(body.as_bytes())?.into();
        self.outbound
            .send(frame)
            .await
            .map_err(|_| WireError::Send(format!("session {} closed", self.id)))
    }
}
