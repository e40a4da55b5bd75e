use anyhow::Result;
use clap::Parser;

use livetoken::{config::load_config, init_tracing, server};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing();

    let mut config = load_config(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    server::start_server(config).await
}
