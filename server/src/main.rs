use clap::Parser;
use log::info;
use server::auth::AcceptAll;
use server::network::{Server, ServerEvent};
use shared::messages::ConfirmationType;
use shared::tcp::TcpTransport;
use shared::SessionConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "10515")]
    port: u16,

    /// Maximum number of simultaneous peers
    #[arg(short, long, default_value = "10")]
    max_connections: usize,

    /// Shared key connecting peers must present
    #[arg(short, long, default_value = "test")]
    key: String,

    /// Network poll interval in milliseconds
    #[arg(long, default_value = "15")]
    poll_ms: u64,

    /// Do not replay the existing roster to newly confirmed peers
    #[arg(long)]
    no_roster_sync: bool,

    /// Required confirmation type: none, custom or ticket
    #[arg(long, default_value = "none")]
    confirmation: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let confirmation = match args.confirmation.as_str() {
        "none" => ConfirmationType::None,
        "custom" => ConfirmationType::Custom,
        "ticket" => ConfirmationType::PlatformTicket,
        other => return Err(format!("unknown confirmation type: {}", other).into()),
    };

    let config = SessionConfig {
        port: args.port,
        max_connections: args.max_connections,
        connection_key: args.key.clone(),
        poll_interval: Duration::from_millis(args.poll_ms),
        sync_roster_to_new_peer: !args.no_roster_sync,
        required_confirmation: confirmation,
    };

    let transport = Arc::new(TcpTransport::server(
        SocketAddr::from(([0, 0, 0, 0], args.port)),
        args.max_connections,
        &args.key,
    ));
    let (mut session, mut events) = Server::new(config, transport, Arc::new(AcceptAll));

    session.start()?;
    let handle = session.handle();

    let loop_task = tokio::spawn(async move { session.run().await });
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::PeerConnected(peer) => {
                    info!("Peer {} connected, awaiting confirmation", peer.id());
                }
                ServerEvent::PeerConfirmed { handle, data } => {
                    info!(
                        "Peer {} confirmed as '{}'",
                        handle.id(),
                        String::from_utf8_lossy(&data)
                    );
                }
                ServerEvent::RequestReceived { handle, envelope } => {
                    info!(
                        "Request {} from peer {} ({} byte payload, {} ms ping)",
                        envelope.id,
                        handle.id(),
                        envelope.payload.len(),
                        handle.latency_ms()
                    );
                }
                ServerEvent::PeerDisconnected { handle, reason } => {
                    info!("Peer {} disconnected: {:?}", handle.id(), reason);
                }
            }
        }
    });

    tokio::select! {
        _ = loop_task => {}
        _ = event_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.stop();
        }
    }

    Ok(())
}
