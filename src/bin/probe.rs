use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bitmessage::bootstrap::{DnsResolver, Endpoint, Resolver};
use bitmessage::session::{HandshakeConfig, NonceRegistry, Role, Session};
use bitmessage::transport::{Dialer, TcpDialer};
use bitmessage::wire::Message;
use tracing_subscriber::EnvFilter;

/// Talks to a single Bitmessage node.
#[derive(Parser)]
#[command(name = "bm-probe")]
struct Cli {
    /// Peer address, `ip:port` or `host:port`.
    #[arg(long)]
    node: String,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform the version/verack exchange and print what the peer announced.
    Handshake,
    /// Stay connected and print every message the peer sends.
    Listen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    let addr = match cli.node.parse::<Endpoint>()? {
        Endpoint::Addr(addr) => addr,
        Endpoint::Host { host, port } => {
            let ip = DnsResolver
                .resolve(&host)
                .await?
                .into_iter()
                .next()
                .ok_or("could not resolve address")?;
            std::net::SocketAddr::new(ip, port)
        }
    };

    println!("Connecting to {addr}");
    let stream = TcpDialer::new(timeout).dial(addr).await?;

    let mut session = Session::new(
        stream,
        Role::Outbound,
        Arc::new(HandshakeConfig::default()),
        Arc::new(NonceRegistry::new()),
    )?;
    session.handshake_within(timeout).await?;

    match cli.command {
        Commands::Handshake => print_version(&session),
        Commands::Listen => {
            print_version(&session);
            listen(&mut session).await?;
        }
    }

    session.close().await;
    Ok(())
}

fn print_version<C: bitmessage::transport::Connection>(session: &Session<C>) {
    let Some(version) = session.peer_version() else {
        return;
    };

    println!("Protocol version: {}", version.version);
    println!("User agent: {}", version.user_agent);
    println!("Services: {:?}", version.services);
    println!("Streams: {:?}", version.streams);
    println!("Common streams: {:?}", session.common_streams());
    println!("Peer listens on port {}", version.addr_from.port);
}

async fn listen<C: bitmessage::transport::Connection>(
    session: &mut Session<C>,
) -> Result<(), Box<dyn Error>> {
    loop {
        match session.recv().await {
            Ok(Message::Addr(entries)) => {
                println!("Received {} addresses", entries.len());
                for e in entries {
                    println!("  stream {} {}", e.stream, e.socket_addr());
                }
            }
            Ok(Message::Inv(vectors)) => {
                println!("Received inv with {} objects", vectors.len());
            }
            Ok(other) => println!("Received: {}", other.command()),
            Err(bitmessage::error::HandshakeError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                println!("Peer closed connection.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}
