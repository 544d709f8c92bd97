use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use pairgate::archive::{ArchiveConfig, HttpArchive};
use pairgate::socket::DevSocketProvider;
use pairgate::{Config, HttpServer, Orchestrator};

#[derive(Debug, Parser)]
#[command(name = "pairgate", version, about = "Device-linking pairing service")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "PAIRGATE_ADDR", default_value = "127.0.0.1:8077")]
    addr: SocketAddr,

    /// Emit logs as JSON.
    #[arg(long, env = "PAIRGATE_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::from_env()?;
    let archive = Arc::new(HttpArchive::new(ArchiveConfig::from_env()?));
    let orchestrator = Orchestrator::new(config, Arc::new(DevSocketProvider::new()), archive);

    let server = HttpServer::start(cli.addr, orchestrator).await?;
    tracing::info!(addr = %server.addr(), "pairgate ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
