//! Client connection state machine.
//!
//! Mirrors the server's handshake from the single-peer side: wait for the
//! confirmation requirement, produce a credential off the polling loop,
//! submit it and track the verdict. Roster notifications and application
//! envelopes flow through to the application untouched.

use crate::auth::CredentialProvider;
use log::{info, warn};
use shared::envelope::Envelope;
use shared::messages::{ConfirmationSubmit, ControlMessage};
use shared::transport::{DisconnectReason, Transport, TransportError, TransportEvent};
use shared::SessionConfig;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::interval;

/// Sentinel for "no server connection".
const NO_PEER: u64 = u64::MAX;

/// Where the handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport connect requested, outcome unknown.
    Connecting,
    /// Transport-level connection up, waiting for the server to say what
    /// kind of credential it wants.
    AwaitingRequirement,
    /// Credential production or submission in flight.
    Submitting,
    /// Confirmed by the server.
    Connected,
}

/// Session events surfaced to the application.
#[derive(Debug)]
pub enum ClientEvent {
    /// The server's confirmation verdict, accepted or not.
    Connected {
        accepted: bool,
        assigned_id: i32,
        data: Vec<u8>,
    },
    /// Application envelope, forwarded unchanged.
    RequestReceived(Envelope),
    /// Another peer joined the server's roster.
    RemotePeerJoined { id: i32, data: Vec<u8> },
    /// Another peer left the server's roster.
    RemotePeerLeft { id: i32 },
    /// The transport connection ended.
    ConnectionLost(DisconnectReason),
}

#[derive(Debug)]
enum ClientCommand {
    CredentialReady(Vec<u8>),
    Shutdown,
}

/// Clonable surface for talking to the server while the polling loop owns
/// the state machine.
#[derive(Clone)]
pub struct ClientHandle {
    transport: Arc<dyn Transport>,
    server_peer: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    ping: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    cmd_tx: UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    /// Sends without a server connection are dropped silently.
    pub fn send_reliable(&self, envelope: &Envelope) {
        let peer = self.server_peer.load(Ordering::SeqCst);
        if peer == NO_PEER {
            return;
        }
        if let Err(e) = self.transport.send_reliable(peer, envelope.encode()) {
            warn!("Reliable send failed: {}", e);
        }
    }

    pub fn send_unreliable(&self, envelope: &Envelope) {
        let peer = self.server_peer.load(Ordering::SeqCst);
        if peer == NO_PEER {
            return;
        }
        if let Err(e) = self.transport.send_unreliable(peer, envelope.encode()) {
            warn!("Unreliable send failed: {}", e);
        }
    }

    /// Whether the server confirmed this client.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Most recent round-trip latency to the server.
    pub fn ping_ms(&self) -> u32 {
        self.ping.load(Ordering::SeqCst)
    }

    /// Stops the polling loop and drops the connection. Idempotent.
    pub fn disconnect(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Disconnecting");
        }
        let _ = self.cmd_tx.send(ClientCommand::Shutdown);
        self.transport.stop();
        self.connected.store(false, Ordering::SeqCst);
        self.server_peer.store(NO_PEER, Ordering::SeqCst);
    }
}

/// The client-side session state machine.
pub struct Client {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    provider: Arc<dyn CredentialProvider>,
    state: ConnectionState,
    server_peer: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    ping: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    event_tx: UnboundedSender<ClientEvent>,
    cmd_tx: UnboundedSender<ClientCommand>,
    cmd_rx: UnboundedReceiver<ClientCommand>,
}

impl Client {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn CredentialProvider>,
    ) -> (Self, UnboundedReceiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let client = Self {
            config,
            transport,
            provider,
            state: ConnectionState::Disconnected,
            server_peer: Arc::new(AtomicU64::new(NO_PEER)),
            connected: Arc::new(AtomicBool::new(false)),
            ping: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            event_tx,
            cmd_tx,
            cmd_rx,
        };
        (client, event_rx)
    }

    /// Starts the transport and requests a connection. The handshake plays
    /// out in [`Client::run`].
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        info!("Trying to connect to {}:{}", host, port);
        self.transport.start()?;
        self.transport
            .connect(host, port, &self.config.connection_key)?;
        self.state = ConnectionState::Connecting;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            transport: Arc::clone(&self.transport),
            server_peer: Arc::clone(&self.server_peer),
            connected: Arc::clone(&self.connected),
            ping: Arc::clone(&self.ping),
            running: Arc::clone(&self.running),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn ping_ms(&self) -> u32 {
        self.ping.load(Ordering::SeqCst)
    }

    /// Stops the polling loop and drops the connection. Idempotent.
    pub fn disconnect(&mut self) {
        self.handle().disconnect();
        self.state = ConnectionState::Disconnected;
    }

    /// Polling loop. Runs until [`Client::disconnect`] or
    /// [`ClientHandle::disconnect`].
    pub async fn run(&mut self) {
        let mut tick = interval(self.config.poll_interval);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(ClientCommand::CredentialReady(credential)) => {
                        self.submit_credential(credential);
                    }
                    Some(ClientCommand::Shutdown) | None => break,
                },
                _ = tick.tick() => {
                    for event in self.transport.poll_events() {
                        self.handle_transport_event(event);
                    }
                },
            }
        }
        info!("Client loop stopped");
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, addr } => {
                info!("Connected to server at {}", addr);
                self.server_peer.store(peer, Ordering::SeqCst);
                self.state = ConnectionState::AwaitingRequirement;
            }
            TransportEvent::PeerDisconnected { reason, .. } => {
                info!("Disconnected from server: {:?}", reason);
                self.server_peer.store(NO_PEER, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                self.state = ConnectionState::Disconnected;
                let _ = self.event_tx.send(ClientEvent::ConnectionLost(reason));
            }
            TransportEvent::DataReceived { peer, data } => {
                self.on_data_received(peer, &data);
            }
            TransportEvent::LatencyUpdated { latency_ms, .. } => {
                self.ping.store(latency_ms, Ordering::SeqCst);
            }
            TransportEvent::Error { message } => {
                warn!("Transport error: {}", message);
            }
        }
    }

    fn on_data_received(&mut self, peer: u64, data: &[u8]) {
        let mut envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope from server: {}", e);
                return;
            }
        };
        envelope.peer = peer;

        match ControlMessage::from_envelope(&envelope) {
            Ok(Some(ControlMessage::ConfirmationRequired(require))) => {
                info!(
                    "Server requires confirmation: {:?}",
                    require.confirmation_type
                );
                self.state = ConnectionState::Submitting;
                // Producing the credential may take a while; keep polling
                // and pick the result up as a command.
                let provider = Arc::clone(&self.provider);
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let credential = provider.produce().await;
                    let _ = cmd_tx.send(ClientCommand::CredentialReady(credential));
                });
            }
            Ok(Some(ControlMessage::ConfirmationResponse(response))) => {
                self.connected.store(response.accepted, Ordering::SeqCst);
                self.state = if response.accepted {
                    info!("Confirmed by server as peer {}", response.assigned_id);
                    ConnectionState::Connected
                } else {
                    info!("Server refused the confirmation");
                    ConnectionState::Disconnected
                };
                let _ = self.event_tx.send(ClientEvent::Connected {
                    accepted: response.accepted,
                    assigned_id: response.assigned_id,
                    data: response.data,
                });
            }
            Ok(Some(ControlMessage::PeerJoined(joined))) => {
                let _ = self.event_tx.send(ClientEvent::RemotePeerJoined {
                    id: joined.peer_id,
                    data: joined.data,
                });
            }
            Ok(Some(ControlMessage::PeerLeft(left))) => {
                let _ = self
                    .event_tx
                    .send(ClientEvent::RemotePeerLeft { id: left.peer_id });
            }
            Ok(Some(ControlMessage::ConfirmationSubmit(_))) => {
                warn!("Server sent a confirmation submission, ignoring");
            }
            Ok(None) => {
                let _ = self.event_tx.send(ClientEvent::RequestReceived(envelope));
            }
            Err(e) => {
                warn!(
                    "Dropping control envelope {} from server: {}",
                    envelope.id, e
                );
            }
        }
    }

    fn submit_credential(&mut self, credential: Vec<u8>) {
        if self.state != ConnectionState::Submitting {
            // The connection went away while the credential was produced.
            info!("Credential ready after the handshake ended, ignoring");
            return;
        }
        let submit = ConfirmationSubmit { credential };
        self.handle().send_reliable(&submit.into_envelope(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredential;
    use shared::messages::{
        ConfirmationRequired, ConfirmationResponse, ConfirmationType, PeerJoined, PeerLeft,
    };
    use shared::testing::ScriptedTransport;
    use shared::transport::SERVER_PEER_ID;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_WAIT: Duration = Duration::from_secs(5);

    fn server_addr() -> SocketAddr {
        "127.0.0.1:10515".parse().unwrap()
    }

    fn new_client(
        credential: &[u8],
    ) -> (
        Client,
        UnboundedReceiver<ClientEvent>,
        Arc<ScriptedTransport>,
    ) {
        let transport = ScriptedTransport::new();
        let (client, events) = Client::new(
            SessionConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticCredential(credential.to_vec())),
        );
        (client, events, transport)
    }

    fn deliver(client: &mut Client, envelope: Envelope) {
        client.handle_transport_event(TransportEvent::DataReceived {
            peer: SERVER_PEER_ID,
            data: envelope.encode(),
        });
    }

    /// Plays the transport connect and confirmation requirement, then
    /// relays the produced credential back into the state machine.
    async fn run_handshake_to_submit(client: &mut Client) {
        client.handle_transport_event(TransportEvent::PeerConnected {
            peer: SERVER_PEER_ID,
            addr: server_addr(),
        });
        assert_eq!(client.state(), ConnectionState::AwaitingRequirement);

        deliver(
            client,
            ConfirmationRequired {
                confirmation_type: ConfirmationType::None,
            }
            .into_envelope(0),
        );
        assert_eq!(client.state(), ConnectionState::Submitting);

        let command = timeout(RECV_WAIT, client.cmd_rx.recv())
            .await
            .expect("credential never produced")
            .expect("command channel closed");
        match command {
            ClientCommand::CredentialReady(credential) => client.submit_credential(credential),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_starts_transport_with_key() {
        let (mut client, _events, transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();

        assert!(transport.was_started());
        assert_eq!(
            transport.connect_calls(),
            vec![("127.0.0.1".to_string(), 10515, "test".to_string())]
        );
        assert_eq!(client.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_handshake_submits_credential() {
        let (mut client, _events, transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;

        let sent = transport.sent_to(SERVER_PEER_ID);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].reliable);
        let envelope = Envelope::decode(&sent[0].data).unwrap();
        assert_eq!(envelope.id, ConfirmationSubmit::ID);
        let submit = ConfirmationSubmit::decode_payload(&envelope.payload).unwrap();
        assert_eq!(submit.credential, b"nick");
    }

    #[tokio::test]
    async fn test_accepted_response_connects() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;

        deliver(
            &mut client,
            ConfirmationResponse {
                assigned_id: 3,
                accepted: true,
                data: b"nick".to_vec(),
            }
            .into_envelope(0),
        );

        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Connected);
        match events.try_recv().unwrap() {
            ClientEvent::Connected {
                accepted,
                assigned_id,
                data,
            } => {
                assert!(accepted);
                assert_eq!(assigned_id, 3);
                assert_eq!(data, b"nick");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_response_reports_and_stays_unconnected() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;

        deliver(
            &mut client,
            ConfirmationResponse {
                assigned_id: -1,
                accepted: false,
                data: Vec::new(),
            }
            .into_envelope(0),
        );

        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // The verdict is reported either way.
        match events.try_recv().unwrap() {
            ClientEvent::Connected {
                accepted,
                assigned_id,
                ..
            } => {
                assert!(!accepted);
                assert_eq!(assigned_id, -1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roster_events_leave_connected_flag_alone() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;
        deliver(
            &mut client,
            ConfirmationResponse {
                assigned_id: 1,
                accepted: true,
                data: Vec::new(),
            }
            .into_envelope(0),
        );
        while events.try_recv().is_ok() {}

        deliver(
            &mut client,
            PeerJoined {
                peer_id: 2,
                data: b"other".to_vec(),
            }
            .into_envelope(0),
        );
        deliver(&mut client, PeerLeft { peer_id: 2 }.into_envelope(0));

        match events.try_recv().unwrap() {
            ClientEvent::RemotePeerJoined { id, data } => {
                assert_eq!(id, 2);
                assert_eq!(data, b"other");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.try_recv().unwrap() {
            ClientEvent::RemotePeerLeft { id } => assert_eq!(id, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_application_envelope_forwarded() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;

        deliver(&mut client, Envelope::new(99, 5, b"state".to_vec()));
        match events.try_recv().unwrap() {
            ClientEvent::RequestReceived(envelope) => {
                assert_eq!(envelope.id, 99);
                assert_eq!(envelope.frame, 5);
                assert_eq!(envelope.peer, SERVER_PEER_ID);
                assert_eq!(envelope.payload, b"state");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_envelope_dropped() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        client.handle_transport_event(TransportEvent::DataReceived {
            peer: SERVER_PEER_ID,
            data: vec![0xFF],
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_disconnect_resets_state() {
        let (mut client, mut events, _transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        run_handshake_to_submit(&mut client).await;
        deliver(
            &mut client,
            ConfirmationResponse {
                assigned_id: 1,
                accepted: true,
                data: Vec::new(),
            }
            .into_envelope(0),
        );
        while events.try_recv().is_ok() {}

        client.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: SERVER_PEER_ID,
            reason: DisconnectReason::RemoteConnectionClose,
        });

        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        match events.try_recv().unwrap() {
            ClientEvent::ConnectionLost(reason) => {
                assert_eq!(reason, DisconnectReason::RemoteConnectionClose);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_credential_after_disconnect_is_dropped() {
        let (mut client, _events, transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        client.handle_transport_event(TransportEvent::PeerConnected {
            peer: SERVER_PEER_ID,
            addr: server_addr(),
        });
        deliver(
            &mut client,
            ConfirmationRequired {
                confirmation_type: ConfirmationType::None,
            }
            .into_envelope(0),
        );
        client.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: SERVER_PEER_ID,
            reason: DisconnectReason::Timeout,
        });

        let command = timeout(RECV_WAIT, client.cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match command {
            ClientCommand::CredentialReady(credential) => client.submit_credential(credential),
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_latency_updates() {
        let (mut client, _events, _transport) = new_client(b"nick");
        client.handle_transport_event(TransportEvent::LatencyUpdated {
            peer: SERVER_PEER_ID,
            latency_ms: 41,
        });
        assert_eq!(client.ping_ms(), 41);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut client, _events, transport) = new_client(b"nick");
        client.connect("127.0.0.1", 10515).unwrap();
        client.disconnect();
        client.disconnect();

        assert!(transport.was_stopped());
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sends_without_server_are_dropped() {
        let (client, _events, transport) = new_client(b"nick");
        let handle = client.handle();
        handle.send_reliable(&Envelope::new(10, 0, Vec::new()));
        handle.send_unreliable(&Envelope::new(11, 0, Vec::new()));
        assert!(transport.sent().is_empty());
    }
}
