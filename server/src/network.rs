//! Server connection and confirmation state machine.
//!
//! One polling loop drives everything: each tick drains the transport's
//! event queue, and an internal command channel feeds authorization
//! verdicts back into the same loop. The `authorize` call itself runs on a
//! spawned task, so a peer whose check is slow never holds up handshake or
//! application traffic for anyone else; only the resulting state change is
//! serialized here.

use crate::auth::{AuthorizationHandler, AuthorizationResponse};
use crate::peer::{PeerHandle, PeerRegistry, ServerPeer};
use log::{info, warn};
use shared::envelope::Envelope;
use shared::messages::{
    ConfirmationRequired, ConfirmationResponse, ConfirmationSubmit, ControlMessage, PeerJoined,
    PeerLeft,
};
use shared::transport::{DisconnectReason, PeerId, Transport, TransportError, TransportEvent};
use shared::SessionConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time::interval;

/// Session events surfaced to the application.
#[derive(Debug)]
pub enum ServerEvent {
    /// Transport-level connect; the peer is queued but not yet authorized.
    PeerConnected(PeerHandle),
    /// The peer passed authorization and joined the roster.
    PeerConfirmed { handle: PeerHandle, data: Vec<u8> },
    /// Application envelope from a confirmed peer, forwarded unchanged.
    RequestReceived { handle: PeerHandle, envelope: Envelope },
    /// A confirmed peer went away.
    PeerDisconnected {
        handle: PeerHandle,
        reason: DisconnectReason,
    },
}

/// Commands routed back into the polling loop from other tasks.
#[derive(Debug)]
enum SessionCommand {
    AuthorizationResolved {
        peer: PeerId,
        response: AuthorizationResponse,
    },
    Shutdown,
}

/// Clonable control surface usable while the polling loop runs.
#[derive(Clone)]
pub struct ServerHandle {
    transport: Arc<dyn Transport>,
    registry: Arc<RwLock<PeerRegistry>>,
    running: Arc<AtomicBool>,
    cmd_tx: UnboundedSender<SessionCommand>,
}

impl ServerHandle {
    /// Reliable send to every confirmed peer. Queued peers never receive
    /// broadcasts.
    pub async fn send_to_all_reliable(&self, envelope: &Envelope) {
        let encoded = envelope.encode();
        let registry = self.registry.read().await;
        for peer in registry.confirmed() {
            peer.handle().send_reliable(encoded.clone());
        }
    }

    /// Reliable send to every confirmed peer except `except`.
    pub async fn send_to_all_reliable_except(&self, envelope: &Envelope, except: PeerId) {
        let encoded = envelope.encode();
        let registry = self.registry.read().await;
        for peer in registry.confirmed() {
            if peer.id == except {
                continue;
            }
            peer.handle().send_reliable(encoded.clone());
        }
    }

    /// Unreliable send to every confirmed peer.
    pub async fn send_to_all_unreliable(&self, envelope: &Envelope) {
        let encoded = envelope.encode();
        let registry = self.registry.read().await;
        for peer in registry.confirmed() {
            peer.handle().send_unreliable(encoded.clone());
        }
    }

    pub async fn confirmed_count(&self) -> usize {
        self.registry.read().await.confirmed_len()
    }

    pub async fn pending_count(&self) -> usize {
        self.registry.read().await.pending_len()
    }

    /// Halts the polling loop and releases the transport. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Server stopping");
        }
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        self.transport.stop();
    }
}

/// The server-side session state machine.
pub struct Server {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn AuthorizationHandler>,
    registry: Arc<RwLock<PeerRegistry>>,
    running: Arc<AtomicBool>,
    event_tx: UnboundedSender<ServerEvent>,
    cmd_tx: UnboundedSender<SessionCommand>,
    cmd_rx: UnboundedReceiver<SessionCommand>,
}

impl Server {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn AuthorizationHandler>,
    ) -> (Self, UnboundedReceiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let server = Self {
            config,
            transport,
            handler,
            registry: Arc::new(RwLock::new(PeerRegistry::new())),
            running: Arc::new(AtomicBool::new(false)),
            event_tx,
            cmd_tx,
            cmd_rx,
        };
        (server, event_rx)
    }

    /// Binds the transport. On failure the instance stays unstarted and
    /// can be retried.
    pub fn start(&self) -> Result<(), TransportError> {
        info!("Trying to start server on port {}", self.config.port);
        self.transport.start()?;
        self.running.store(true, Ordering::SeqCst);
        info!("Server started");
        Ok(())
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            running: Arc::clone(&self.running),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Polling loop. Runs until [`Server::stop`] or [`ServerHandle::stop`];
    /// a failure while handling one event skips that event only.
    pub async fn run(&mut self) {
        let mut tick = interval(self.config.poll_interval);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(SessionCommand::AuthorizationResolved { peer, response }) => {
                        self.finish_authorization(peer, response).await;
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                _ = tick.tick() => {
                    for event in self.transport.poll_events() {
                        self.handle_transport_event(event).await;
                    }
                },
            }
        }
        info!("Server loop stopped");
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, addr } => {
                self.on_peer_connected(peer, addr).await;
            }
            TransportEvent::PeerDisconnected { peer, reason } => {
                self.on_peer_disconnected(peer, reason).await;
            }
            TransportEvent::DataReceived { peer, data } => {
                self.on_data_received(peer, &data).await;
            }
            TransportEvent::LatencyUpdated { peer, latency_ms } => {
                self.registry.read().await.update_latency(peer, latency_ms);
            }
            TransportEvent::Error { message } => {
                warn!("Transport error: {}", message);
            }
        }
    }

    async fn on_peer_connected(&mut self, peer: PeerId, addr: SocketAddr) {
        let mut registry = self.registry.write().await;
        let entry = ServerPeer::new(peer, addr, Arc::clone(&self.transport));
        let handle = entry.handle();
        if !registry.insert_pending(entry) {
            warn!("Connect notification for peer {} which is already tracked", peer);
            return;
        }
        info!("Peer {} connected from {}, awaiting confirmation", peer, addr);

        let require = ConfirmationRequired {
            confirmation_type: self.config.required_confirmation,
        };
        handle.send_reliable(require.into_envelope(0).encode());
        let _ = self.event_tx.send(ServerEvent::PeerConnected(handle));
    }

    async fn on_data_received(&mut self, peer: PeerId, data: &[u8]) {
        let mut envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope from peer {}: {}", peer, e);
                return;
            }
        };
        // On receipt the field carries the sender.
        envelope.peer = peer;

        match ControlMessage::from_envelope(&envelope) {
            Ok(Some(ControlMessage::ConfirmationSubmit(submit))) => {
                self.on_confirmation_submit(peer, submit).await;
            }
            Ok(Some(_)) => {
                warn!(
                    "Peer {} sent control envelope {} that never travels to the server, ignoring",
                    peer, envelope.id
                );
            }
            Ok(None) => self.on_application_envelope(peer, envelope).await,
            Err(e) => {
                warn!(
                    "Dropping control envelope {} from peer {}: {}",
                    envelope.id, peer, e
                );
            }
        }
    }

    async fn on_confirmation_submit(&mut self, peer: PeerId, submit: ConfirmationSubmit) {
        if !self.registry.read().await.is_pending(peer) {
            warn!(
                "Confirmation submitted by peer {} which is not awaiting one, ignoring",
                peer
            );
            return;
        }

        // The check runs off the loop; only its verdict comes back here.
        let handler = Arc::clone(&self.handler);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let response = handler.authorize(submit.credential).await;
            let _ = cmd_tx.send(SessionCommand::AuthorizationResolved { peer, response });
        });
    }

    async fn finish_authorization(&mut self, peer: PeerId, response: AuthorizationResponse) {
        let mut registry = self.registry.write().await;
        if !registry.is_pending(peer) {
            warn!(
                "Authorization for peer {} resolved after it left the queue, ignoring",
                peer
            );
            return;
        }

        if !response.authorized {
            if let Some(handle) = registry.pending_handle(peer) {
                let reply = ConfirmationResponse {
                    assigned_id: -1,
                    accepted: false,
                    data: Vec::new(),
                };
                handle.send_reliable(reply.into_envelope(0).encode());
            }
            registry.remove_pending(peer);
            info!("Peer {} was not confirmed and has been removed", peer);
            return;
        }

        let handle = match registry.confirm(peer, response.data.clone()) {
            Some(handle) => handle,
            None => return,
        };
        info!("Peer {} confirmed", peer);

        let reply = ConfirmationResponse {
            assigned_id: peer as i32,
            accepted: true,
            data: response.data.clone(),
        };
        handle.send_reliable(reply.into_envelope(0).encode());

        // Announce the newcomer to everyone already on the roster.
        let joined = PeerJoined {
            peer_id: peer as i32,
            data: response.data.clone(),
        }
        .into_envelope(0)
        .encode();
        for other in registry.confirmed() {
            if other.id == peer {
                continue;
            }
            other.handle().send_reliable(joined.clone());
        }

        // Walk the newcomer through the roster it missed.
        if self.config.sync_roster_to_new_peer {
            for other in registry.confirmed() {
                if other.id == peer {
                    continue;
                }
                let known = PeerJoined {
                    peer_id: other.id as i32,
                    data: other.auth_data.clone(),
                };
                handle.send_reliable(known.into_envelope(0).encode());
            }
        }

        let _ = self.event_tx.send(ServerEvent::PeerConfirmed {
            handle,
            data: response.data,
        });
    }

    async fn on_application_envelope(&mut self, peer: PeerId, envelope: Envelope) {
        let registry = self.registry.read().await;
        match registry.confirmed_handle(peer) {
            Some(handle) => {
                let _ = self
                    .event_tx
                    .send(ServerEvent::RequestReceived { handle, envelope });
            }
            None => {
                warn!(
                    "Dropping envelope {} from unconfirmed peer {}",
                    envelope.id, peer
                );
            }
        }
    }

    async fn on_peer_disconnected(&mut self, peer: PeerId, reason: DisconnectReason) {
        let mut registry = self.registry.write().await;
        match registry.remove(peer) {
            Some((entry, true)) => {
                info!("Peer {} disconnected: {:?}", peer, reason);
                let left = PeerLeft {
                    peer_id: peer as i32,
                }
                .into_envelope(0)
                .encode();
                for other in registry.confirmed() {
                    other.handle().send_reliable(left.clone());
                }
                let _ = self.event_tx.send(ServerEvent::PeerDisconnected {
                    handle: entry.handle(),
                    reason,
                });
            }
            Some((_, false)) => {
                // Never visible to the roster, so nothing to broadcast.
                info!("Unconfirmed peer {} disconnected: {:?}", peer, reason);
            }
            None => {
                warn!("Disconnect notification for unknown peer {} ({:?})", peer, reason);
            }
        }
    }
}
