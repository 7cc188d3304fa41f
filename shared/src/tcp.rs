//! Reference transport over TCP.
//!
//! Frames every message with a kind byte and a length prefix, gates
//! incoming connections on the shared connection key and the configured
//! connection limit, and measures round-trip latency with periodic ping
//! frames. TCP itself supplies ordered, guaranteed delivery, so both send
//! flavors meet at least the guarantee the caller asked for. This is a
//! delivery mechanism, not a reliability protocol.
//!
//! Each connection runs two tasks: a reader that turns frames into
//! [`TransportEvent`]s and a writer that drains the per-peer outbound
//! queue. Events accumulate in a shared queue that `poll_events` drains.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::transport::{
    DisconnectReason, PeerId, Transport, TransportError, TransportEvent, SERVER_PEER_ID,
};

const FRAME_HELLO: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_REJECT: u8 = 3;
const FRAME_DATA: u8 = 4;
const FRAME_PING: u8 = 5;
const FRAME_PONG: u8 = 6;

/// Upper bound for one link frame; larger declarations are treated as a
/// protocol violation and end the connection.
const MAX_FRAME_LEN: usize = 1 << 20;

const PING_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Frame {
    kind: u8,
    body: Vec<u8>,
}

async fn read_frame(stream: &mut OwnedReadHalf) -> io::Result<Frame> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let kind = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame { kind, body })
}

async fn write_frame(stream: &mut OwnedWriteHalf, kind: u8, body: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(kind);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    stream.write_all(&out).await
}

enum LinkCommand {
    Send(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

struct LinkHandle {
    tx: UnboundedSender<LinkCommand>,
    addr: SocketAddr,
}

struct Inner {
    events: Mutex<VecDeque<TransportEvent>>,
    links: Mutex<HashMap<PeerId, LinkHandle>>,
    next_peer_id: AtomicU64,
    running: AtomicBool,
    shutdown: Notify,
}

impl Inner {
    fn push_event(&self, event: TransportEvent) {
        lock(&self.events).push_back(event);
    }
}

// Lock poisoning only happens after a panic elsewhere; recover the data
// rather than propagating a second failure.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// TCP-backed [`Transport`]. Server role listens and admits connections;
/// client role opens a single outgoing connection per `connect` call.
pub struct TcpTransport {
    bind_addr: Option<SocketAddr>,
    max_connections: usize,
    connection_key: String,
    local_addr: Mutex<Option<SocketAddr>>,
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Listening transport. Incoming peers get ids starting at 1.
    pub fn server(bind_addr: SocketAddr, max_connections: usize, connection_key: &str) -> Self {
        Self {
            bind_addr: Some(bind_addr),
            max_connections,
            connection_key: connection_key.to_string(),
            local_addr: Mutex::new(None),
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                links: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(SERVER_PEER_ID + 1),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Connecting transport. The first outgoing connection becomes peer 0.
    pub fn client() -> Self {
        Self {
            bind_addr: None,
            max_connections: 1,
            connection_key: String::new(),
            local_addr: Mutex::new(None),
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                links: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(SERVER_PEER_ID),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Actual listening address once started. Useful with an ephemeral
    /// bind port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

impl Transport for TcpTransport {
    fn start(&self) -> Result<(), TransportError> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(bind_addr) = self.bind_addr {
            // Bind synchronously so a taken port surfaces to the caller
            // instead of a background task.
            let listener = std::net::TcpListener::bind(bind_addr)?;
            listener.set_nonblocking(true)?;
            *lock(&self.local_addr) = Some(listener.local_addr()?);
            let listener = TcpListener::from_std(listener)?;
            let inner = Arc::clone(&self.inner);
            let key = self.connection_key.clone();
            let max_connections = self.max_connections;
            self.inner.running.store(true, Ordering::SeqCst);
            tokio::spawn(async move {
                run_listener(listener, inner, key, max_connections).await;
            });
        } else {
            self.inner.running.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        let links: Vec<(PeerId, LinkHandle)> = lock(&self.inner.links).drain().collect();
        for (peer, link) in links {
            let _ = link.tx.send(LinkCommand::Close);
            self.inner.push_event(TransportEvent::PeerDisconnected {
                peer,
                reason: DisconnectReason::DisconnectPeerCalled,
            });
        }
    }

    fn connect(&self, host: &str, port: u16, key: &str) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning);
        }
        let inner = Arc::clone(&self.inner);
        let host = host.to_string();
        let key = key.to_string();
        let peer = self.inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(reason) = establish(&host, port, &key, peer, Arc::clone(&inner)).await {
                inner.push_event(TransportEvent::PeerDisconnected { peer, reason });
            }
        });
        Ok(())
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        lock(&self.inner.events).drain(..).collect()
    }

    fn send_reliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let links = lock(&self.inner.links);
        match links.get(&peer) {
            Some(link) => link
                .tx
                .send(LinkCommand::Send(data))
                .map_err(|_| TransportError::UnknownPeer(peer)),
            None => Err(TransportError::UnknownPeer(peer)),
        }
    }

    // TCP delivers everything ordered and intact, which is more than the
    // caller asked for here.
    fn send_unreliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        self.send_reliable(peer, data)
    }
}

async fn run_listener(
    listener: TcpListener,
    inner: Arc<Inner>,
    key: String,
    max_connections: usize,
) {
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let inner = Arc::clone(&inner);
                    let key = key.clone();
                    tokio::spawn(async move {
                        admit(stream, addr, inner, key, max_connections).await;
                    });
                }
                Err(e) => {
                    inner.push_event(TransportEvent::Error {
                        message: format!("accept failed: {}", e),
                    });
                }
            },
        }
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!("Listener stopped");
}

/// Connection-request gate: the first frame must be a hello carrying the
/// shared key, and the connection count must be below the limit.
async fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    inner: Arc<Inner>,
    key: String,
    max_connections: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half)).await {
        Ok(Ok(frame)) if frame.kind == FRAME_HELLO => frame,
        _ => {
            debug!("Connection from {} dropped before a valid hello", addr);
            return;
        }
    };

    let at_capacity = lock(&inner.links).len() >= max_connections;
    if at_capacity || hello.body != key.as_bytes() {
        info!(
            "Rejecting connection from {}: {}",
            addr,
            if at_capacity { "server full" } else { "bad connection key" }
        );
        let _ = write_frame(&mut write_half, FRAME_REJECT, &[]).await;
        return;
    }

    if write_frame(&mut write_half, FRAME_ACCEPT, &[]).await.is_err() {
        return;
    }

    let peer = inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::unbounded_channel();
    lock(&inner.links).insert(peer, LinkHandle { tx: tx.clone(), addr });
    inner.push_event(TransportEvent::PeerConnected { peer, addr });
    info!("Accepted connection from {} as peer {}", addr, peer);

    let started = Instant::now();
    tokio::spawn(run_writer(write_half, rx, started));
    run_reader(peer, read_half, tx, inner, started).await;
}

async fn establish(
    host: &str,
    port: u16,
    key: &str,
    peer: PeerId,
    inner: Arc<Inner>,
) -> Result<(), DisconnectReason> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|_| DisconnectReason::ConnectionFailed)?;
    let _ = stream.set_nodelay(true);
    let addr = stream
        .peer_addr()
        .map_err(|_| DisconnectReason::ConnectionFailed)?;
    let (mut read_half, mut write_half) = stream.into_split();

    write_frame(&mut write_half, FRAME_HELLO, key.as_bytes())
        .await
        .map_err(|_| DisconnectReason::ConnectionFailed)?;

    match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half)).await {
        Ok(Ok(frame)) if frame.kind == FRAME_ACCEPT => {}
        Ok(Ok(frame)) if frame.kind == FRAME_REJECT => {
            return Err(DisconnectReason::ConnectionRejected)
        }
        Ok(Ok(_)) => return Err(DisconnectReason::InvalidProtocol),
        Ok(Err(_)) => return Err(DisconnectReason::ConnectionFailed),
        Err(_) => return Err(DisconnectReason::Timeout),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    lock(&inner.links).insert(peer, LinkHandle { tx: tx.clone(), addr });
    inner.push_event(TransportEvent::PeerConnected { peer, addr });
    info!("Connected to {} as peer {}", addr, peer);

    let started = Instant::now();
    tokio::spawn(run_writer(write_half, rx, started));
    tokio::spawn(run_reader(peer, read_half, tx, inner, started));
    Ok(())
}

/// Turns incoming frames into events until the connection ends. Owns the
/// read half; pongs go out through the writer's queue.
async fn run_reader(
    peer: PeerId,
    mut read_half: OwnedReadHalf,
    tx: UnboundedSender<LinkCommand>,
    inner: Arc<Inner>,
    started: Instant,
) {
    let reason = loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break DisconnectReason::DisconnectPeerCalled,
            frame = read_frame(&mut read_half) => match frame {
                Ok(frame) if frame.kind == FRAME_DATA => {
                    inner.push_event(TransportEvent::DataReceived {
                        peer,
                        data: frame.body,
                    });
                }
                Ok(frame) if frame.kind == FRAME_PING => {
                    if tx.send(LinkCommand::Pong(frame.body)).is_err() {
                        break DisconnectReason::RemoteConnectionClose;
                    }
                }
                Ok(frame) if frame.kind == FRAME_PONG => {
                    if frame.body.len() == 8 {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&frame.body);
                        let sent_at = u64::from_le_bytes(raw);
                        let now = started.elapsed().as_millis() as u64;
                        inner.push_event(TransportEvent::LatencyUpdated {
                            peer,
                            latency_ms: now.saturating_sub(sent_at) as u32,
                        });
                    }
                }
                Ok(frame) => {
                    warn!("Peer {} sent unknown frame kind {}", peer, frame.kind);
                    break DisconnectReason::InvalidProtocol;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("Peer {} violated framing: {}", peer, e);
                    break DisconnectReason::InvalidProtocol;
                }
                Err(_) => break DisconnectReason::RemoteConnectionClose,
            },
        }
    };

    let _ = tx.send(LinkCommand::Close);
    // stop() already drained the map and reported the disconnect.
    if lock(&inner.links).remove(&peer).is_some() {
        inner.push_event(TransportEvent::PeerDisconnected { peer, reason });
    }
}

/// Drains the outbound queue and keeps the ping clock. Dropping the write
/// half on exit sends FIN, which unblocks the remote reader.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<LinkCommand>,
    started: Instant,
) {
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(LinkCommand::Send(data)) => {
                    if write_frame(&mut write_half, FRAME_DATA, &data).await.is_err() {
                        break;
                    }
                }
                Some(LinkCommand::Pong(body)) => {
                    if write_frame(&mut write_half, FRAME_PONG, &body).await.is_err() {
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => break,
            },
            _ = ping_timer.tick() => {
                let stamp = (started.elapsed().as_millis() as u64).to_le_bytes();
                if write_frame(&mut write_half, FRAME_PING, &stamp).await.is_err() {
                    break;
                }
            },
        }
    }
}
