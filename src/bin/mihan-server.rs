//! Standalone upgrade server
//!
//! Loads a TOML config, accepts upgrades and holds every connection open
//! until the peer goes away.
//!
//! ```text
//! RUST_LOG=mihan_ws=debug mihan-server --config server.toml --port 9001
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mihan_ws::config::{FileConfig, ServerConfigBuilder};
use mihan_ws::{Connection, UpgradeRequest, WebSocketServer};

#[derive(Debug, Parser)]
#[command(name = "mihan-server", version, about = "WebSocket upgrade server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overrides the file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mihan_ws=info,mihan_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut builder = match &args.config {
        Some(path) => FileConfig::from_file(path)?.into_builder(),
        None => ServerConfigBuilder::new(),
    };
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    let config = builder.build()?;

    let server = WebSocketServer::bind(config).await?;
    tracing::info!(addr = %server.local_addr(), "mihan-server ready");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    server.serve_with_shutdown(hold, shutdown).await?;
    Ok(())
}

/// Keep the connection until the peer closes it
async fn hold(mut conn: Connection<tokio::net::TcpStream>, req: UpgradeRequest) {
    tracing::info!(
        peer = ?req.peer_addr(),
        path = req.path(),
        protocol = ?conn.protocol(),
        extensions = ?conn.extensions(),
        "connection"
    );

    let mut received = conn.head().len();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match conn.get_mut().read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) => {
                tracing::debug!(error = %e, "read failed");
                break;
            }
        }
    }

    conn.set_closed();
    tracing::info!(peer = ?req.peer_addr(), received, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::try_parse_from(["mihan-server", "--config", "server.toml", "-p", "9001"])
            .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("server.toml")));
        assert_eq!(args.port, Some(9001));

        let args = Args::try_parse_from(["mihan-server"]).unwrap();
        assert!(args.config.is_none() && args.port.is_none());
    }
}
