#![warn(missing_docs)]
//! BrickFS command-line daemon

use anyhow::Result;
use brickfs_daemon::cli::Cli;
use brickfs_daemon::LogFormat;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log.level))?;
    let json = config.log.format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .init();

    tracing::info!("BrickFS starting with {}", cli.config.display());

    cli.run(config).await
}
