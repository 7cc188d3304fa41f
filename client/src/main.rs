use clap::Parser;
use log::info;
use client::auth::StaticCredential;
use client::network::{Client, ClientEvent};
use shared::tcp::TcpTransport;
use shared::SessionConfig;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short, long, default_value = "10515")]
    port: u16,

    /// Shared connection key
    #[arg(short, long, default_value = "test")]
    key: String,

    /// Display name submitted as the credential
    #[arg(short, long, default_value = "anon")]
    nickname: String,

    /// Network poll interval in milliseconds
    #[arg(long, default_value = "15")]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = SessionConfig {
        port: args.port,
        connection_key: args.key,
        poll_interval: Duration::from_millis(args.poll_ms),
        ..SessionConfig::default()
    };

    let (mut session, mut events) = Client::new(
        config,
        Arc::new(TcpTransport::client()),
        Arc::new(StaticCredential(args.nickname.into_bytes())),
    );

    session.connect(&args.server, args.port)?;
    let handle = session.handle();

    let loop_task = tokio::spawn(async move { session.run().await });
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected {
                    accepted,
                    assigned_id,
                    data,
                } => {
                    if accepted {
                        info!(
                            "Confirmed as peer {} ('{}')",
                            assigned_id,
                            String::from_utf8_lossy(&data)
                        );
                    } else {
                        info!("Server refused the connection");
                        break;
                    }
                }
                ClientEvent::RequestReceived(envelope) => {
                    info!(
                        "Request {} from server ({} byte payload)",
                        envelope.id,
                        envelope.payload.len()
                    );
                }
                ClientEvent::RemotePeerJoined { id, data } => {
                    info!(
                        "Remote peer {} joined ('{}')",
                        id,
                        String::from_utf8_lossy(&data)
                    );
                }
                ClientEvent::RemotePeerLeft { id } => {
                    info!("Remote peer {} left", id);
                }
                ClientEvent::ConnectionLost(reason) => {
                    info!("Connection lost: {:?}", reason);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = loop_task => {}
        _ = event_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Disconnecting...");
        }
    }
    handle.disconnect();

    Ok(())
}
