//! Sandcastle CLI
//!
//! Creates throwaway Talos clusters on the local Docker daemon.

use clap::Parser;

use sandcastle_cli::{Cli, Result};
use sandcastle_common::telemetry::{init_tracing, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env())?;

    let cli = Cli::parse();
    cli.run().await
}
