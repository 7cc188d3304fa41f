//! Peer bookkeeping for the session server
//!
//! This module tracks every remote endpoint the server knows about, split
//! across two disjoint collections:
//! - the confirmation queue: peers connected at the transport level but
//!   still waiting for their authorization to resolve
//! - the roster: peers that passed authorization and are visible to
//!   broadcasts
//!
//! The split exists so a slow authorization for one peer never blocks
//! traffic to anyone else: queued peers stay fully reachable for sends and
//! keepalives while their check is in flight.

use log::warn;
use shared::transport::{PeerId, Transport};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Send-and-identity capability handed to the application
///
/// A handle carries the peer id, a live latency reading and the two send
/// operations, nothing else. Send failures are transport-local: they are
/// logged and the operation is dropped, other peers keep working.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    latency: Arc<AtomicU32>,
    transport: Arc<dyn Transport>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Most recent round-trip latency reported by the transport.
    pub fn latency_ms(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn send_reliable(&self, data: Vec<u8>) {
        if let Err(e) = self.transport.send_reliable(self.id, data) {
            warn!("Reliable send to peer {} failed: {}", self.id, e);
        }
    }

    pub fn send_unreliable(&self, data: Vec<u8>) {
        if let Err(e) = self.transport.send_unreliable(self.id, data) {
            warn!("Unreliable send to peer {} failed: {}", self.id, e);
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle").field("id", &self.id).finish()
    }
}

/// Server-side record of one remote endpoint
#[derive(Debug)]
pub struct ServerPeer {
    /// Transport-assigned connection identifier
    pub id: PeerId,
    /// Remote address observed at connect time
    pub addr: SocketAddr,
    /// Round-trip latency cell shared with every handle for this peer
    pub latency: Arc<AtomicU32>,
    /// Opaque bytes returned by the authorization check; empty until the
    /// peer is confirmed
    pub auth_data: Vec<u8>,
    handle: PeerHandle,
}

impl ServerPeer {
    pub fn new(id: PeerId, addr: SocketAddr, transport: Arc<dyn Transport>) -> Self {
        let latency = Arc::new(AtomicU32::new(0));
        let handle = PeerHandle {
            id,
            latency: Arc::clone(&latency),
            transport,
        };
        Self {
            id,
            addr,
            latency,
            auth_data: Vec::new(),
            handle,
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }
}

/// The two peer collections and the moves between them
///
/// A peer id lives in at most one of the queue and the roster at any time.
/// Every mutation is a single insert, remove or move under the caller's
/// lock, so no caller can observe a peer in both places or in a half-moved
/// state.
#[derive(Default)]
pub struct PeerRegistry {
    /// Connected but not yet authorized, keyed by transport id
    pending: HashMap<PeerId, ServerPeer>,
    /// Authorized and visible to broadcasts, keyed by transport id
    confirmed: HashMap<PeerId, ServerPeer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly connected peer to the confirmation queue
    ///
    /// Returns false without touching anything when the id is already
    /// tracked in either collection; the caller treats that as a duplicate
    /// connect notification.
    pub fn insert_pending(&mut self, peer: ServerPeer) -> bool {
        if self.pending.contains_key(&peer.id) || self.confirmed.contains_key(&peer.id) {
            return false;
        }
        self.pending.insert(peer.id, peer);
        true
    }

    pub fn is_pending(&self, id: PeerId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn is_confirmed(&self, id: PeerId) -> bool {
        self.confirmed.contains_key(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.is_pending(id) || self.is_confirmed(id)
    }

    /// Moves a peer from the confirmation queue into the roster
    ///
    /// Stores the authorization data on the peer as part of the move.
    /// Returns the peer's handle, or None when the id is not queued (it
    /// disconnected while its authorization was in flight).
    pub fn confirm(&mut self, id: PeerId, auth_data: Vec<u8>) -> Option<PeerHandle> {
        let mut peer = self.pending.remove(&id)?;
        peer.auth_data = auth_data;
        let handle = peer.handle();
        self.confirmed.insert(id, peer);
        Some(handle)
    }

    /// Drops a queued peer after a rejected authorization
    pub fn remove_pending(&mut self, id: PeerId) -> Option<ServerPeer> {
        self.pending.remove(&id)
    }

    /// Removes a peer from whichever collection holds it
    ///
    /// The flag reports whether the peer was confirmed, which decides if a
    /// departure broadcast is owed.
    pub fn remove(&mut self, id: PeerId) -> Option<(ServerPeer, bool)> {
        if let Some(peer) = self.confirmed.remove(&id) {
            return Some((peer, true));
        }
        self.pending.remove(&id).map(|peer| (peer, false))
    }

    /// Stores a latency reading for a peer in either collection
    pub fn update_latency(&self, id: PeerId, latency_ms: u32) -> bool {
        match self.pending.get(&id).or_else(|| self.confirmed.get(&id)) {
            Some(peer) => {
                peer.latency.store(latency_ms, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Roster iteration, in the map's own order
    pub fn confirmed(&self) -> impl Iterator<Item = &ServerPeer> {
        self.confirmed.values()
    }

    pub fn confirmed_handle(&self, id: PeerId) -> Option<PeerHandle> {
        self.confirmed.get(&id).map(|peer| peer.handle())
    }

    pub fn pending_handle(&self, id: PeerId) -> Option<PeerHandle> {
        self.pending.get(&id).map(|peer| peer.handle())
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.confirmed.is_empty()
    }
}
