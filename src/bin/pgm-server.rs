#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Store-and-forward message broker server

use clap::Parser;
use pgm_messenger::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgm-server")]
#[command(about = "Account-scoped store-and-forward message broker")]
struct Args {
    /// Listening port (falls back to PGM_SERVER_PORT, then 6666)
    port: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig::from_args(args.port.as_deref());

    let server = Server::bind(&config).await?;
    server.run().await?;

    Ok(())
}
