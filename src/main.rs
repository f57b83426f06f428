use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

use bitmessage::config::NodeConfig;
use bitmessage::node::Node;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bitmessage-node", version, about = "Bitmessage peer node")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `network.listen_addr`.
    #[arg(long)]
    listen: Option<String>,

    /// Overrides `logging.level`. `RUST_LOG` takes precedence over both.
    #[arg(long)]
    log_level: Option<String>,

    /// Only dial out; do not accept inbound connections.
    #[arg(long)]
    no_listen: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let listener = if cli.no_listen {
        None
    } else {
        Some(TcpListener::bind(config.listen_addr()?).await?)
    };

    let mut node = Node::from_config(&config)?;

    // Nothing to bootstrap from is only fatal when nobody can reach us either.
    match node.bootstrap().await {
        Ok(started) => info!(started, "bootstrap attempts started"),
        Err(err) if listener.is_some() => error!(error = %err, "bootstrap failed"),
        Err(err) => return Err(err.into()),
    }

    node.run(listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await?;

    info!("stopped");
    Ok(())
}
