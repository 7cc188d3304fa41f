//! # Session Client Library
//!
//! Client half of the peer-authentication and session layer. It drives
//! the three-message handshake from the connecting side: the server
//! announces what kind of credential it requires, a pluggable provider
//! produces one asynchronously, and the server's verdict decides whether
//! the session is live. Roster notifications about other peers and all
//! application envelopes are passed through to the caller untouched.
//!
//! ## Module Organization
//!
//! - [`auth`]: the credential provider port
//! - [`network`]: the connection state machine and its polling loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::auth::StaticCredential;
//! use client::network::Client;
//! use shared::tcp::TcpTransport;
//! use shared::SessionConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut client, mut events) = Client::new(
//!         SessionConfig::default(),
//!         Arc::new(TcpTransport::client()),
//!         Arc::new(StaticCredential(b"nick".to_vec())),
//!     );
//!
//!     client.connect("127.0.0.1", 10515)?;
//!     let handle = client.handle();
//!     tokio::spawn(async move { client.run().await });
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     handle.disconnect();
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod network;
