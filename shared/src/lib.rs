use std::time::Duration;

pub mod envelope;
pub mod messages;
pub mod tcp;
pub mod testing;
pub mod transport;

pub use envelope::{DecodeError, Envelope};
pub use messages::ConfirmationType;
pub use transport::{DisconnectReason, PeerId, Transport, TransportError, TransportEvent};

pub const DEFAULT_PORT: u16 = 10515;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_CONNECTION_KEY: &str = "test";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Read-only settings shared by both session state machines.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port the server listens on and clients connect to.
    pub port: u16,
    /// Connection limit enforced at transport admission.
    pub max_connections: usize,
    /// Shared key a connection request must present.
    pub connection_key: String,
    /// Interval between transport event drains.
    pub poll_interval: Duration,
    /// Replay the existing roster to every newly confirmed peer.
    pub sync_roster_to_new_peer: bool,
    /// Credential kind advertised to connecting peers.
    pub required_confirmation: ConfirmationType,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_key: DEFAULT_CONNECTION_KEY.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            sync_roster_to_new_peer: true,
            required_confirmation: ConfirmationType::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 10515);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_key, "test");
        assert_eq!(config.poll_interval, Duration::from_millis(15));
        assert!(config.sync_roster_to_new_peer);
        assert_eq!(config.required_confirmation, ConfirmationType::None);
    }
}
