//! # Session Server Library
//!
//! Server half of the peer-authentication and session layer that sits
//! between a datagram-style transport and the application's own messages.
//! It owns the connection lifecycle: every transport-level connect lands
//! in a confirmation queue, runs through a pluggable asynchronous
//! authorization check, and only then joins the roster that application
//! traffic and presence broadcasts operate on.
//!
//! ## Core Responsibilities
//!
//! ### Confirmation Queue
//! Authorization can take arbitrarily long (a web service round trip, a
//! platform ticket validation), so connecting peers wait in their own
//! collection while checks run on spawned tasks. Traffic for every other
//! peer keeps flowing; only the verdict re-enters the polling loop.
//!
//! ### Roster Maintenance
//! Confirmed peers form the visible roster. Joins and departures are
//! broadcast reliably to every other confirmed peer, and a newly
//! confirmed peer can be brought up to date with one join message per
//! existing member.
//!
//! ### Request Routing
//! Envelopes with reserved ids are handled internally; everything else is
//! surfaced to the application together with a capability handle for
//! replying to that peer.
//!
//! ## Module Organization
//!
//! - [`peer`]: the pending/confirmed collections, per-peer state and the
//!   capability handles exposed to the application
//! - [`auth`]: the authorization port and stock handlers
//! - [`network`]: the polling loop and the confirmation state machine
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::AcceptAll;
//! use server::network::Server;
//! use shared::tcp::TcpTransport;
//! use shared::SessionConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::default();
//!     let transport = Arc::new(TcpTransport::server(
//!         ([0, 0, 0, 0], config.port).into(),
//!         config.max_connections,
//!         &config.connection_key,
//!     ));
//!     let (mut server, mut events) = Server::new(config, transport, Arc::new(AcceptAll));
//!
//!     server.start()?;
//!     let handle = server.handle();
//!     tokio::spawn(async move { server.run().await });
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     handle.stop();
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod network;
pub mod peer;
