//! Capability surface the session layer requires from a transport.
//!
//! The session state machines never touch sockets themselves. They consume
//! a pollable event stream and per-peer send calls from an implementation
//! of [`Transport`]; delivery guarantees, retransmission and connection
//! admission live behind this boundary.

use std::net::SocketAddr;
use thiserror::Error;

/// Transport-assigned connection identifier. Unique per active connection;
/// an id is only ever reused after the previous holder fully disconnected.
pub type PeerId = u64;

/// The one remote peer a client transport talks to.
pub const SERVER_PEER_ID: PeerId = 0;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionFailed,
    Timeout,
    RemoteConnectionClose,
    DisconnectPeerCalled,
    ConnectionRejected,
    InvalidProtocol,
}

/// Events drained from [`Transport::poll_events`], in the order the
/// transport observed them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerConnected { peer: PeerId, addr: SocketAddr },
    PeerDisconnected { peer: PeerId, reason: DisconnectReason },
    DataReceived { peer: PeerId, data: Vec<u8> },
    LatencyUpdated { peer: PeerId, latency_ms: u32 },
    Error { message: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("transport is not running")]
    NotRunning,
}

/// Required transport capabilities.
///
/// Send calls must not block: implementations queue the bytes and report
/// immediate failures only (unknown peer, transport stopped). Reliable
/// sends to the same peer preserve submission order; nothing is promised
/// across peers. `poll_events` drains whatever has arrived so far and
/// returns without waiting.
pub trait Transport: Send + Sync {
    /// Bind and begin processing. An `Err` leaves the transport unstarted.
    fn start(&self) -> Result<(), TransportError>;

    /// Drop every connection and stop processing. Idempotent.
    fn stop(&self);

    /// Open an outgoing connection, presenting `key` for admission. The
    /// outcome arrives later as a `PeerConnected` or `PeerDisconnected`
    /// event.
    fn connect(&self, host: &str, port: u16, key: &str) -> Result<(), TransportError>;

    /// Drain currently queued events without blocking.
    fn poll_events(&self) -> Vec<TransportEvent>;

    /// Queue `data` for ordered, guaranteed delivery to `peer`.
    fn send_reliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError>;

    /// Queue `data` with no ordering or delivery promise. Implementations
    /// may deliver with stronger guarantees than asked for.
    fn send_unreliable(&self, peer: PeerId, data: Vec<u8>) -> Result<(), TransportError>;
}
